// tandem-common: wire protocol and shared types for the Tandem sync gateway

pub mod protocol;
pub mod types;
