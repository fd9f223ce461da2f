pub mod client;
pub mod daemon;
pub mod debugger;
pub mod driver;
pub mod log;
pub mod protocol;
pub mod tools;

pub mod version {
    /// Current crate version, substituted at build time.
    pub const GUMSHOE_VERSION: &str = env!("CARGO_PKG_VERSION");
}
