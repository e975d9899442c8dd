pub mod mac;
pub mod protocol;

pub use mac::*;
pub use protocol::*;
