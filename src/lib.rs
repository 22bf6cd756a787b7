// src/lib.rs
//! Receiver side of QR-code pairing: a one-shot LAN HTTP endpoint that takes
//! an access key from a phone and hands it to the caller.

pub mod address;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod qr;
pub mod server;
pub mod token;

pub use address::{AddressSource, FixedAddress, InterfaceAddresses, NoAddress};
pub use config::Config;
pub use error::PairError;
pub use orchestrator::{KeyConsumer, PairingDisplay, PairingOrchestrator, PairingStatus};
pub use qr::QrEncoder;
pub use server::{Locale, PageRenderer, SessionServer};
pub use token::SessionToken;
