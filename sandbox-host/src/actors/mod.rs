pub mod installer_actor;
pub mod settings_actor;

pub use installer_actor::{InstallerActor, InstallerMsg};
pub use settings_actor::SettingsPollerActor;
