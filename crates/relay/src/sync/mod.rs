pub mod registry;
pub mod replica;
pub mod session;

pub use registry::{FlushReport, RegistryError, SessionRegistry};
pub use session::{DocumentSession, Member, UpdateOutcome};
