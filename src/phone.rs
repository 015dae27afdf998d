//! Phone identity normalization for WhatsApp routing.
//!
//! The gateway identifies chats by JID (`5511999990000@s.whatsapp.net`)
//! while the CRM stores phones in whatever format the user typed. These
//! helpers project both onto a single national-format digit string so
//! inbound messages can be matched to parceiros and outbound sends can
//! rebuild a JID. All functions are pure and never fail: malformed input
//! yields an empty or best-effort string, since this feeds best-effort
//! matching, not validation.

/// Brazilian country calling code.
const COUNTRY_CODE: &str = "55";

/// Suffix the gateway uses for individual chats.
const JID_SUFFIX: &str = "@s.whatsapp.net";

/// Normalize a free-form phone string to bare national-format digits.
///
/// Strips all non-digit characters; if the result carries the `55`
/// country prefix in front of a full 10-11 digit national number, the
/// prefix is stripped as well.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    // A national number is 10-11 digits, so only strip the prefix when
    // enough digits remain after it. "5511..." with 10 digits total is a
    // plain landline in DDD 55, not a country-prefixed number.
    if digits.starts_with(COUNTRY_CODE) && digits.len() >= COUNTRY_CODE.len() + 10 {
        digits[COUNTRY_CODE.len()..].to_string()
    } else {
        digits
    }
}

/// Extract the national phone number from a gateway chat identifier.
pub fn jid_to_phone(jid: &str) -> String {
    let user_part = jid.split('@').next().unwrap_or("");
    normalize_phone(user_part)
}

/// Build a gateway chat identifier from a national phone number.
pub fn phone_to_jid(phone: &str) -> String {
    let national = normalize_phone(phone);
    format!("{}{}{}", COUNTRY_CODE, national, JID_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_formatting_characters() {
        assert_eq!(normalize_phone("(11) 99999-0000"), "11999990000");
        assert_eq!(normalize_phone("11 3333-4444"), "1133334444");
    }

    #[test]
    fn strips_country_prefix_from_full_numbers() {
        assert_eq!(normalize_phone("5511999990000"), "11999990000");
        assert_eq!(normalize_phone("+55 11 99999-0000"), "11999990000");
        assert_eq!(normalize_phone("551133334444"), "1133334444");
    }

    #[test]
    fn keeps_ddd_55_landline_intact() {
        // 10 digits starting with 55 is DDD 55 (Mato Grosso do Sul), not
        // a country-prefixed number.
        assert_eq!(normalize_phone("5533334444"), "5533334444");
    }

    #[test]
    fn jid_round_trip() {
        let jid = phone_to_jid("11999990000");
        assert_eq!(jid, "5511999990000@s.whatsapp.net");
        assert_eq!(jid_to_phone(&jid), "11999990000");
        assert_eq!(phone_to_jid(&jid_to_phone(&jid)), jid);
    }

    #[test]
    fn malformed_input_is_best_effort() {
        assert_eq!(normalize_phone(""), "");
        assert_eq!(normalize_phone("not a phone"), "");
        assert_eq!(jid_to_phone("@s.whatsapp.net"), "");
        assert_eq!(jid_to_phone("garbage"), "");
    }

    #[test]
    fn group_jids_extract_leading_digits_only() {
        // Group JIDs carry a hyphenated id; the caller is expected to
        // filter groups out before matching, but extraction must not panic.
        let phone = jid_to_phone("5511999990000-1612345678@g.us");
        assert!(phone.chars().all(|c| c.is_ascii_digit()));
    }
}
