//! Gerente-Parceiro Messaging Bridge
//!
//! This library provides the messaging core of the partner-referral CRM:
//! per-gerente WhatsApp gateway instances, idempotent webhook ingestion,
//! chat routing with a CRM fallback, and the CNPJ duplicate-detection bot.
//!
//! # Modules
//!
//! - `bot`: Chat-embedded CNPJ duplicate-detection workflow.
//! - `chat`: Conversation log and message routing.
//! - `config`: Configuration management.
//! - `db`: Database connection and pool management.
//! - `errors`: Error handling types.
//! - `gateway_client`: WhatsApp gateway client.
//! - `handlers`: HTTP request handlers and shared state.
//! - `instance`: Per-gerente instance lifecycle state machine.
//! - `models`: Core data models.
//! - `phone`: Phone/JID normalization.
//! - `services`: Collaborator services (CNPJ lookup, users, indications, notifications).
//! - `webhook_handler`: Gateway webhook handler.
//! - `webhook_models`: Webhook payload models.

pub mod bot;
pub mod chat;
pub mod config;
pub mod db;
pub mod errors;
pub mod gateway_client;
pub mod handlers;
pub mod instance;
pub mod models;
pub mod phone;
pub mod services;
pub mod webhook_handler;
pub mod webhook_models;
