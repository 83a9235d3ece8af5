//! Package manifest: the metadata a Backend reads out of an unpacked
//! package's `sandstorm-manifest` file before it can boot a grain.
//!
//! Grounded in `original_source/src/sandstorm/spk.h`'s `spk::Manifest` usage
//! (the capnp schema itself is outside the retrieved pack, so the shape
//! below follows the fields `backend.h`/`supervisor.h` actually consume:
//! one or more `Command`s and the app's declared proc-mount need).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub app_title: String,
    pub commands: Vec<Command>,
    /// The app declared it needs a private `/proc` mount (spec §4.1 step 6).
    pub mount_proc: bool,
}

impl Manifest {
    pub fn main_command(&self) -> Option<&Command> {
        self.commands.first()
    }

    pub fn parse_toml(source: &str) -> Result<Self, ManifestError> {
        toml::from_str(source).map_err(ManifestError::from)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("manifest declares no commands")]
    NoCommands,
}

impl Manifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.commands.is_empty() {
            return Err(ManifestError::NoCommands);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_manifest() {
        let src = r#"
            app_title = "Example App"
            mount_proc = false

            [[commands]]
            argv = ["/app.sh"]
            env = [["PORT", "8080"]]
        "#;
        let manifest = Manifest::parse_toml(src).unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.app_title, "Example App");
        assert_eq!(manifest.main_command().unwrap().argv, vec!["/app.sh"]);
    }

    #[test]
    fn rejects_manifest_with_no_commands() {
        let manifest = Manifest {
            app_title: "x".into(),
            commands: vec![],
            mount_proc: false,
        };
        assert!(matches!(manifest.validate(), Err(ManifestError::NoCommands)));
    }
}
