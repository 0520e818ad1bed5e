pub mod instance;
pub mod version;
