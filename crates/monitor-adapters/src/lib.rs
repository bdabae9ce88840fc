//! Effectful adapters to the downstream alerting systems.
//!
//! The executor drives two pushes: definition versions go to the ruler's
//! HTTP config API, receiver versions are merged into the dispatcher's
//! config document held in a cluster secret. Both adapters are thin; the
//! interesting logic lives in `monitor-store` and `monitor-manifest`.

pub mod dispatcher;
pub mod ruler;
pub mod secrets;
pub mod vault;

pub use dispatcher::DispatcherConfigUpdater;
pub use monitor_manifest::RewriteOptions;
pub use ruler::{RulerClient, RulerConfig};
pub use secrets::{KubeSecretConfig, KubeSecretStore, MemoryConfigStore};
pub use vault::{VaultClient, VaultConfig};
