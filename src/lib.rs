mod bio;
mod copier;
mod device;
mod exception;
mod exception_store;
mod exception_table;
mod executor;
mod origin;
mod pending;
mod registry;
pub mod result; // Must be exposed for the helper macros
mod snapshot;
mod table;

#[cfg(test)]
mod scenarios;

pub use bio::Bio;
pub use bio::Direction;
pub use bio::Disposition;
pub use bio::EndIo;
pub use bio::Target;
pub use copier::CopyDone;
pub use copier::CopyEngine;
pub use copier::CopyOutcome;
pub use copier::Copier;
pub use copier::Region;
pub use device::BlockDevice;
pub use device::FileDevice;
pub use device::MemoryDevice;
pub use exception::Chunk;
pub use exception::ChunkGeometry;
pub use exception::Exception;
pub use exception::SECTOR_SIZE;
pub use exception_store::create_store;
pub use exception_store::CommitDone;
pub use exception_store::ExceptionStore;
pub use exception_store::PersistenceMode;
pub use exception_store::PersistentStore;
pub use exception_store::StoreState;
pub use exception_store::TransientStore;
pub use exception_table::DEFAULT_HASH_TABLE_MEMORY_BUDGET;
pub use origin::OriginTarget;
pub use registry::Registry;
pub use result::Error;
pub use result::ErrorKind;
pub use result::Result;
pub use snapshot::ChunkState;
pub use snapshot::Snapshot;
pub use snapshot::SnapshotTarget;
pub use table::OriginArgs;
pub use table::SnapshotArgs;
pub use table::StatusType;

/// Read the cowsnap configuration from this variable by default.
pub const COWSNAP_CONFIG_ENV_VAR: &str = "COWSNAP_CONFIG";

/// Initialization options for a `Registry`.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Options {
    /// Number of runtime threads that drive pending exceptions.
    pub exception_threads: usize,

    /// Number of copies the default copy engine runs concurrently.
    pub copy_threads: usize,

    /// Upper bound, in bytes, on the bucket array of each snapshot's
    /// complete exception table.
    pub hash_table_memory_budget: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            exception_threads: 1,
            copy_threads: 1,
            hash_table_memory_budget: DEFAULT_HASH_TABLE_MEMORY_BUDGET,
        }
    }
}

/// Attempts to parse the cowsnap config in `config`.  The string's
/// contents must be a config JSON for an `Options` struct, or a
/// "@/path/to/config_file.json".
#[tracing::instrument]
pub fn parse_configuration_string(config: &str) -> Option<Options> {
    if let Some(path) = config.strip_prefix('@') {
        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!(?e, %path, "failed to read cowsnap configuration file");
                return None;
            }
        };

        match serde_json::from_slice(&contents) {
            Ok(parsed) => {
                tracing::info!(?parsed, %path, "found cowsnap configuration");
                Some(parsed)
            }
            Err(e) => {
                tracing::warn!(?e, %path, "failed to parse cowsnap configuration file");
                None
            }
        }
    } else {
        match serde_json::from_str(config) {
            Ok(parsed) => {
                tracing::info!(?parsed, "found cowsnap configuration");
                Some(parsed)
            }
            Err(e) => {
                tracing::warn!(?e, %config, "failed to parse cowsnap configuration string");
                None
            }
        }
    }
}

/// Attempts to load a default cowsnap configuration from the
/// `var_name_or` environment variable, or `COWSNAP_CONFIG_ENV_VAR`
/// if `None`.  The variable's value should be a config JSON for
/// an `Options` struct, or "@/path/to/config_file.json".
#[tracing::instrument]
pub fn load_configuration_from_env(var_name_or: Option<&str>) -> Option<Options> {
    let var_name = var_name_or.unwrap_or(COWSNAP_CONFIG_ENV_VAR);

    let os_value = std::env::var_os(var_name)?;
    let value = if let Some(value) = os_value.to_str() {
        value
    } else {
        tracing::warn!(?os_value, %var_name, "invalid value for cowsnap configuration string");
        return None;
    };

    // An empty value is easier to set than unsetting the variable.
    if value.is_empty() {
        return None;
    }

    parse_configuration_string(value)
}

#[test]
fn test_parse_configuration_string() {
    let options =
        parse_configuration_string(r#"{"copy_threads": 4}"#).expect("should parse partial config");

    assert_eq!(
        options,
        Options {
            copy_threads: 4,
            ..Default::default()
        }
    );
    assert!(parse_configuration_string("{not json").is_none());
    assert!(parse_configuration_string("@/nonexistent/cowsnap.json").is_none());
}

#[test]
fn test_parse_configuration_file() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
    file.write_all(br#"{"exception_threads": 2, "hash_table_memory_budget": 4096}"#)
        .expect("should write");

    let options = parse_configuration_string(&format!("@{}", file.path().display()))
        .expect("should parse file");
    assert_eq!(options.exception_threads, 2);
    assert_eq!(options.copy_threads, 1);
    assert_eq!(options.hash_table_memory_budget, 4096);
}

#[test]
fn test_load_configuration_from_env() {
    let var_name = "COWSNAP_TEST_CONFIG_FROM_ENV";

    std::env::set_var(var_name, "");
    assert!(load_configuration_from_env(Some(var_name)).is_none());

    std::env::set_var(var_name, r#"{"exception_threads": 3}"#);
    assert_eq!(
        load_configuration_from_env(Some(var_name))
            .expect("should load")
            .exception_threads,
        3
    );

    std::env::remove_var(var_name);
    assert!(load_configuration_from_env(Some(var_name)).is_none());
}
