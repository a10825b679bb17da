pub mod loader;
pub mod schema;

pub use loader::{ConfigLoad, load_config, save_config};
pub use schema::{
    DaemonConfig, EncryptedCredential, EngineEntry, EnginesConfig, ExtensionEntry, HardwareProfile,
};
