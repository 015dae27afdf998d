/// Property-based tests using proptest
/// Tests invariants and properties that should hold for all inputs
use proptest::prelude::*;
use rust_parceiros_api::bot::clean_cnpj;
use rust_parceiros_api::phone::{jid_to_phone, normalize_phone, phone_to_jid};

// Property: normalization should never panic
proptest! {
    #[test]
    fn normalize_phone_never_panics(raw in "\\PC*") {
        let _ = normalize_phone(&raw);
    }

    #[test]
    fn jid_to_phone_never_panics(raw in "\\PC*") {
        let _ = jid_to_phone(&raw);
    }

    #[test]
    fn normalized_output_is_digits_only(raw in "\\PC*") {
        let normalized = normalize_phone(&raw);
        prop_assert!(normalized.chars().all(|c| c.is_ascii_digit()));
    }
}

// Property: jid/phone conversions are mutual inverses for national numbers
proptest! {
    #[test]
    fn phone_jid_round_trip(national in "[1-9][0-9]{9,10}") {
        let jid = phone_to_jid(&national);
        prop_assert_eq!(phone_to_jid(&jid_to_phone(&jid)), jid);
    }

    #[test]
    fn jid_carries_country_code_and_suffix(national in "[1-9][0-9]{9,10}") {
        let jid = phone_to_jid(&national);
        prop_assert!(jid.starts_with("55"));
        prop_assert!(jid.ends_with("@s.whatsapp.net"));
    }

    #[test]
    fn country_prefixed_input_normalizes_to_national(national in "[1-9][0-9]{9,10}") {
        let with_prefix = format!("55{}", national);
        prop_assert_eq!(normalize_phone(&with_prefix), national);
    }

    #[test]
    fn formatting_does_not_change_normalization(
        ddd in 11u8..=99u8,
        number in 900000000u32..=999999999u32
    ) {
        let plain = format!("{}{}", ddd, number);
        let formatted = format!("({}) {}-{}", ddd, &plain[2..7], &plain[7..]);
        prop_assert_eq!(normalize_phone(&plain), normalize_phone(&formatted));
    }
}

// Property: CNPJ shape validation
proptest! {
    #[test]
    fn clean_cnpj_never_panics(raw in "\\PC*") {
        let _ = clean_cnpj(&raw);
    }

    #[test]
    fn clean_cnpj_accepts_exactly_14_digits(cnpj in "[0-9]{14}") {
        prop_assert_eq!(clean_cnpj(&cnpj), Some(cnpj));
    }

    #[test]
    fn clean_cnpj_strips_standard_formatting(cnpj in "[0-9]{14}") {
        let formatted = format!(
            "{}.{}.{}/{}-{}",
            &cnpj[0..2], &cnpj[2..5], &cnpj[5..8], &cnpj[8..12], &cnpj[12..14]
        );
        prop_assert_eq!(clean_cnpj(&formatted), Some(cnpj));
    }

    #[test]
    fn clean_cnpj_rejects_wrong_lengths(cnpj in "[0-9]{1,13}") {
        prop_assert_eq!(clean_cnpj(&cnpj), None);
    }
}
