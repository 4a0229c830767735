//! Reads, merges, and writes Docker credential files.
//!
//! Docker has used two incompatible on-disk shapes for its credential store:
//! the legacy `.dockercfg` file, a bare mapping from registry endpoint to
//! credential entry, and the current `config.json` file, which wraps the same
//! mapping in an `auths` object. Both shapes are handled here through a single
//! `CredentialStore` that remembers which schema it was loaded as and
//! serializes back to the same shape.
//!
//! A missing file is not an error; it loads as an empty store so that the
//! first run of the tool can bootstrap the file. Malformed content is, by
//! default, replaced with an empty store as well (`ParseMode::Lenient`);
//! callers that would rather surface corruption pass `ParseMode::Strict`.

use log::warn;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;

use crate::ecr::AuthorizationRecord;

// ECR never checks the email field, but Docker's credential schemas carry it.
const PLACEHOLDER_EMAIL: &str = "none";

// Path suffixes used to auto-detect the schema version.
const V1_SUFFIX: &str = "dockercfg";
const V2_SUFFIX: &str = "config.json";

// Credential files hold tokens; written files should be readable but only
// owner-writable, matching what Docker itself creates.
const STORE_FILE_MODE: u32 = 0o644;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub(super) enum Error {
    #[snafu(display(
        "Could not determine schema version of '{}'; expected a path ending in '{}' or '{}', otherwise pass --schema",
        path.display(),
        V1_SUFFIX,
        V2_SUFFIX
    ))]
    UnknownSchema { path: PathBuf },

    #[snafu(display("Failed to read credential file '{}': {}", path.display(), source))]
    ReadStore {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse credential file '{}': {}", path.display(), source))]
    ParseStore {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to serialize credential store: {}", source))]
    SerializeStore { source: serde_json::Error },

    #[snafu(display("Failed to create tempfile for writing '{}': {}", path.display(), source))]
    CreateTempfile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to write credential data: {}", source))]
    WriteStore { source: std::io::Error },

    #[snafu(display("Failed to set permissions on '{}': {}", path.display(), source))]
    SetPermissions {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to replace credential file '{}': {}", path.display(), source))]
    PersistStore {
        path: PathBuf,
        source: tempfile::PersistError,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// The two on-disk shapes of the Docker credential store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchemaVersion {
    /// Legacy `.dockercfg`: a bare endpoint-to-entry mapping.
    V1,
    /// Current `config.json`: an envelope holding the mapping under `auths`.
    V2,
}

impl SchemaVersion {
    /// Picks the schema version from the target path's suffix.
    pub(crate) fn detect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path.to_string_lossy();
        if name.ends_with(V1_SUFFIX) {
            Ok(Self::V1)
        } else if name.ends_with(V2_SUFFIX) {
            Ok(Self::V2)
        } else {
            UnknownSchemaSnafu { path }.fail()
        }
    }
}

impl FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim_start_matches('.') {
            "dockercfg" => Ok(Self::V1),
            "config.json" => Ok(Self::V2),
            _ => Err(format!(
                "unrecognized schema '{}', expected 'dockercfg' or 'config.json'",
                s
            )),
        }
    }
}

/// How to treat credential files that exist but do not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParseMode {
    /// Start over from an empty store, logging what was ignored.
    Lenient,
    /// Surface the parse error to the caller.
    Strict,
}

/// One stored credential. Both fields are nullable in the encoding; absent
/// fields decode to `None` rather than erroring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AuthEntry {
    pub(crate) auth: Option<String>,
    pub(crate) email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthsEnvelope {
    // `null` and absent both mean "no entries yet".
    auths: Option<BTreeMap<String, AuthEntry>>,
}

#[derive(Debug, Serialize)]
struct AuthsEnvelopeRef<'a> {
    auths: &'a BTreeMap<String, AuthEntry>,
}

/// An in-memory Docker credential store, tied to the schema version it was
/// loaded as. The endpoint keys are unique and kept sorted so that serialized
/// output is deterministic and diffs cleanly.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct CredentialStore {
    version: SchemaVersion,
    entries: BTreeMap<String, AuthEntry>,
}

impl CredentialStore {
    /// Loads the credential file at `path`. A missing file yields an empty
    /// store; an unreadable file is an error. Content that fails to parse is
    /// handled according to `mode`.
    pub(crate) fn load<P: AsRef<Path>>(
        path: P,
        version: SchemaVersion,
        mode: ParseMode,
    ) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self {
                version,
                entries: BTreeMap::new(),
            });
        }

        let contents = fs::read_to_string(path).context(ReadStoreSnafu { path })?;
        let entries = match Self::parse(&contents, version) {
            Ok(entries) => entries,
            Err(source) => match mode {
                ParseMode::Strict => return Err(source).context(ParseStoreSnafu { path }),
                ParseMode::Lenient => {
                    warn!(
                        "Ignoring malformed credential file '{}': {}",
                        path.display(),
                        source
                    );
                    BTreeMap::new()
                }
            },
        };

        Ok(Self { version, entries })
    }

    fn parse(
        contents: &str,
        version: SchemaVersion,
    ) -> serde_json::Result<BTreeMap<String, AuthEntry>> {
        match version {
            SchemaVersion::V1 => serde_json::from_str(contents),
            SchemaVersion::V2 => {
                let envelope: AuthsEnvelope = serde_json::from_str(contents)?;
                Ok(envelope.auths.unwrap_or_default())
            }
        }
    }

    /// Folds authorization records into the store, in order. An endpoint that
    /// is already present has only its token overwritten, keeping whatever
    /// email value was stored; a new endpoint gets the placeholder email.
    /// Later records win when the same endpoint appears more than once.
    /// Entries are never removed.
    pub(crate) fn merge(&mut self, records: &[AuthorizationRecord]) {
        for record in records {
            match self.entries.get_mut(&record.proxy_endpoint) {
                Some(entry) => entry.auth = Some(record.token.clone()),
                None => {
                    self.entries.insert(
                        record.proxy_endpoint.clone(),
                        AuthEntry {
                            auth: Some(record.token.clone()),
                            email: Some(PLACEHOLDER_EMAIL.to_string()),
                        },
                    );
                }
            }
        }
    }

    /// Serializes the store back to its schema's on-disk shape, two-space
    /// indented. Loading the output again reproduces an equivalent store.
    pub(crate) fn to_json(&self) -> Result<Vec<u8>> {
        match self.version {
            SchemaVersion::V1 => serde_json::to_vec_pretty(&self.entries),
            SchemaVersion::V2 => serde_json::to_vec_pretty(&AuthsEnvelopeRef {
                auths: &self.entries,
            }),
        }
        .context(SerializeStoreSnafu)
    }

    pub(crate) fn get(&self, endpoint: &str) -> Option<&AuthEntry> {
        self.entries.get(endpoint)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Replaces the file at `path` with `bytes`. The data is written to a
/// temporary file in the target's directory first and swapped in with a
/// rename, so a crash mid-write cannot leave a truncated credential file.
pub(crate) fn persist<P: AsRef<Path>>(bytes: &[u8], path: P) -> Result<()> {
    let path = path.as_ref();
    let target_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut temp_file =
        NamedTempFile::new_in(target_dir).context(CreateTempfileSnafu { path })?;
    temp_file.write_all(bytes).context(WriteStoreSnafu)?;

    // Tempfiles are created 0600; widen to what a plain create would have used.
    fs::set_permissions(temp_file.path(), fs::Permissions::from_mode(STORE_FILE_MODE))
        .context(SetPermissionsSnafu { path })?;

    // Create the file if it does not exist. If it does exist, atomically replace it.
    temp_file
        .persist(path)
        .context(PersistStoreSnafu { path })?;

    Ok(())
}
