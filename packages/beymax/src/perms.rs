//! Command permissions from `permissions.yml`.
//!
//! ```yaml
//! defaults:
//!   allow: [$all]
//!   underscore: false
//! rules:
//!   - role: admin
//!     underscore: true
//!   - users: [alice, bob]
//!     deny: [poll]
//! ```
//!
//! A query walks the author's chain of rules until one decides: rules naming
//! the author (rules listing fewer users first), then role rules matching the
//! author's roles in file order, then `defaults`, then a built-in fallback
//! that allows every non-underscore command. `$all` never matches commands
//! starting with `_`; those are decided by `underscore`.
//!
//! User references are resolved to ids when the file is loaded. The file
//! hash and the resolved ids are recorded in the `permissions` scope. If the
//! file is unchanged but a reference now resolves to someone else, the
//! configured [`MatchingPolicy`] decides what happens.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::platform::{Author, Platform, UserId};
use crate::store::{Store, StoreError};

pub const PERMISSIONS_SCOPE: &str = "permissions";

/// Wildcard matching every command not starting with `_`.
pub const ALL: &str = "$all";

#[derive(Debug, Error)]
pub enum PermissionsError {
    #[error("failed to read permissions file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("permissions file is not valid: {0}")]
    Invalid(String),

    #[error("duplicate role '{0}' in permissions file")]
    DuplicateRole(String),

    #[error("user reference '{0}' in permissions file did not match any users")]
    UnknownUser(String),

    #[error("user reference '{reference}' previously matched {previous} but now matches {current}")]
    ReferenceMoved {
        reference: String,
        previous: UserId,
        current: UserId,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What to do when a user reference resolves to a different id than the one
/// recorded for an unchanged permissions file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchingPolicy {
    /// Refuse to load.
    Strict,
    /// Accept the new ids and record them.
    Update,
    /// Deny everything to the moved reference until an operator switches to
    /// `update`.
    #[default]
    #[serde(alias = "previous")]
    Confirm,
}

/// Where a rule came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    User { reference: String, priority: usize },
    Role { role: String },
    Defaults,
    Fallback,
    /// Replaces the rules of a reference that moved to another user.
    Quarantined { reference: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    /// Decision for underscore commands, if this rule makes one.
    pub underscore: Option<bool>,
    pub source: RuleSource,
}

impl Rule {
    fn fallback() -> Self {
        Self {
            allow: vec![ALL.to_string()],
            deny: Vec::new(),
            underscore: Some(false),
            source: RuleSource::Fallback,
        }
    }

    fn quarantined(reference: &str) -> Self {
        Self {
            allow: Vec::new(),
            deny: vec![ALL.to_string()],
            underscore: Some(false),
            source: RuleSource::Quarantined {
                reference: reference.to_string(),
            },
        }
    }

    fn decide(&self, command: &str) -> Option<bool> {
        let underscore = command.starts_with('_');
        let matches = |list: &[String]| {
            list.iter().any(|entry| entry == command) || (!underscore && list.iter().any(|e| e == ALL))
        };
        if matches(&self.allow) {
            Some(true)
        } else if matches(&self.deny) {
            Some(false)
        } else if underscore {
            self.underscore
        } else {
            None
        }
    }
}

/// Result of a permissions query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub source: RuleSource,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleEntry {
    role: Option<String>,
    users: Option<Vec<String>>,
    allow: Option<Vec<String>>,
    deny: Option<Vec<String>>,
    underscore: Option<bool>,
}

impl RuleEntry {
    fn sets_permission(&self) -> bool {
        self.allow.is_some() || self.deny.is_some() || self.underscore.is_some()
    }

    fn rule(&self, source: RuleSource) -> Rule {
        Rule {
            allow: self.allow.clone().unwrap_or_default(),
            deny: self.deny.clone().unwrap_or_default(),
            underscore: self.underscore,
            source,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PermissionsDocument {
    defaults: Option<RuleEntry>,
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Fingerprint {
    sha256: Option<String>,
    #[serde(default)]
    users: BTreeMap<String, UserId>,
}

/// Loaded permission rules.
#[derive(Debug, Clone)]
pub struct Permissions {
    defaults: Rule,
    users: HashMap<UserId, Vec<Rule>>,
    roles: Vec<(String, Rule)>,
    references: BTreeMap<String, UserId>,
}

impl Default for Permissions {
    /// Only the fallback rule: every non-underscore command is allowed.
    fn default() -> Self {
        Self {
            defaults: Rule::fallback(),
            users: HashMap::new(),
            roles: Vec::new(),
            references: BTreeMap::new(),
        }
    }
}

impl Permissions {
    /// Parse rules, resolving user references through `platform`.
    pub fn parse(text: &str, platform: &dyn Platform) -> Result<Self, PermissionsError> {
        let document: PermissionsDocument =
            serde_yaml::from_str(text).map_err(|e| PermissionsError::Invalid(e.to_string()))?;

        let defaults = document
            .defaults
            .ok_or_else(|| PermissionsError::Invalid("missing 'defaults' key".into()))?;
        if defaults.role.is_some() || defaults.users.is_some() {
            return Err(PermissionsError::Invalid(
                "role and users cannot be set on default permissions".into(),
            ));
        }
        if !defaults.sets_permission() {
            return Err(PermissionsError::Invalid(
                "defaults must set some permission (allow, deny, or underscore)".into(),
            ));
        }

        let mut permissions = Self {
            defaults: defaults.rule(RuleSource::Defaults),
            ..Self::default()
        };

        for (index, entry) in document.rules.iter().enumerate() {
            if entry.role.is_some() == entry.users.is_some() {
                return Err(PermissionsError::Invalid(format!(
                    "rule {index}: exactly one of role or users must be set"
                )));
            }
            if !entry.sets_permission() {
                return Err(PermissionsError::Invalid(format!(
                    "rule {index}: must set some permission (allow, deny, or underscore)"
                )));
            }

            if let Some(role) = &entry.role {
                if permissions.roles.iter().any(|(seen, _)| seen == role) {
                    return Err(PermissionsError::DuplicateRole(role.clone()));
                }
                let rule = entry.rule(RuleSource::Role { role: role.clone() });
                permissions.roles.push((role.clone(), rule));
            } else if let Some(users) = &entry.users {
                for reference in users {
                    let id = platform
                        .resolve_user(reference)
                        .ok_or_else(|| PermissionsError::UnknownUser(reference.clone()))?;
                    permissions.references.insert(reference.clone(), id.clone());
                    permissions.users.entry(id).or_default().push(entry.rule(
                        RuleSource::User {
                            reference: reference.clone(),
                            priority: users.len(),
                        },
                    ));
                }
            }
        }

        for rules in permissions.users.values_mut() {
            rules.sort_by_key(|rule| match rule.source {
                RuleSource::User { priority, .. } => priority,
                _ => usize::MAX,
            });
        }
        Ok(permissions)
    }

    /// Load the permissions file and check it against the recorded
    /// fingerprint. A missing file leaves only the fallback rule.
    pub async fn load(
        path: &Path,
        platform: &dyn Platform,
        store: &Store,
        policy: MatchingPolicy,
    ) -> Result<Self, PermissionsError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "permissions file not found, using fallback rules");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(PermissionsError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let text = String::from_utf8(bytes.clone())
            .map_err(|e| PermissionsError::Invalid(e.to_string()))?;
        let mut permissions = Self::parse(&text, platform)?;
        permissions
            .check_fingerprint(store, &hex::encode(Sha256::digest(&bytes)), policy)
            .await?;
        info!(
            path = %path.display(),
            users = permissions.users.len(),
            roles = permissions.roles.len(),
            "permissions loaded"
        );
        Ok(permissions)
    }

    /// Compare resolved references with the ones recorded for `digest`.
    pub async fn check_fingerprint(
        &mut self,
        store: &Store,
        digest: &str,
        policy: MatchingPolicy,
    ) -> Result<(), PermissionsError> {
        let mut tx = store.begin([PERMISSIONS_SCOPE]).await?;
        let recorded: Fingerprint = tx.decode(PERMISSIONS_SCOPE).unwrap_or_default();

        let current = Fingerprint {
            sha256: Some(digest.to_string()),
            users: self.references.clone(),
        };

        if recorded.sha256.as_deref() != Some(digest) {
            info!(sha256 = %digest, "permissions file changed, recording fingerprint");
            tx.encode(PERMISSIONS_SCOPE, &current)?;
            tx.commit().await?;
            return Ok(());
        }

        let moved: Vec<(String, UserId, UserId)> = recorded
            .users
            .iter()
            .filter_map(|(reference, previous)| {
                let now = self.references.get(reference)?;
                (now != previous).then(|| (reference.clone(), previous.clone(), now.clone()))
            })
            .collect();

        for (reference, previous, current) in &moved {
            warn!(%reference, %previous, %current, "permissions user reference moved");
        }

        match (policy, moved.first()) {
            (_, None) => {}
            (MatchingPolicy::Strict, Some((reference, previous, current))) => {
                return Err(PermissionsError::ReferenceMoved {
                    reference: reference.clone(),
                    previous: previous.clone(),
                    current: current.clone(),
                });
            }
            (MatchingPolicy::Update, Some(_)) => {
                info!(moved = moved.len(), "accepting moved permissions references");
                tx.encode(PERMISSIONS_SCOPE, &current)?;
            }
            (MatchingPolicy::Confirm, Some(_)) => {
                for (reference, _, current) in &moved {
                    self.quarantine(reference, current);
                }
                warn!(
                    moved = moved.len(),
                    "moved references denied until permissions_matching is set to update"
                );
            }
        }
        tx.commit().await?;
        Ok(())
    }

    fn quarantine(&mut self, reference: &str, id: &UserId) {
        if let Some(rules) = self.users.get_mut(id) {
            for rule in rules.iter_mut() {
                if matches!(&rule.source, RuleSource::User { reference: r, .. } if r == reference) {
                    *rule = Rule::quarantined(reference);
                }
            }
            // Quarantine rules must win over anything else naming this user.
            rules.sort_by_key(|rule| !matches!(rule.source, RuleSource::Quarantined { .. }));
        }
    }

    /// Rules applying to `author`, highest priority first.
    pub fn chain<'a>(&'a self, author: &Author) -> Vec<&'a Rule> {
        static FALLBACK: std::sync::OnceLock<Rule> = std::sync::OnceLock::new();

        let mut chain: Vec<&Rule> = self
            .users
            .get(&author.id)
            .map(|rules| rules.iter().collect())
            .unwrap_or_default();
        chain.extend(
            self.roles
                .iter()
                .filter(|(role, _)| author.roles.iter().any(|held| held == role))
                .map(|(_, rule)| rule),
        );
        chain.push(&self.defaults);
        chain.push(FALLBACK.get_or_init(Rule::fallback));
        chain
    }

    /// May `author` run `command` (without prefix)?
    pub fn query(&self, author: &Author, command: &str) -> Decision {
        self.chain(author)
            .into_iter()
            .find_map(|rule| {
                rule.decide(command).map(|allowed| Decision {
                    allowed,
                    source: rule.source.clone(),
                })
            })
            .unwrap_or(Decision {
                allowed: false,
                source: RuleSource::Fallback,
            })
    }

    /// May `author` run underscore (administrative) commands at all?
    pub fn query_underscore(&self, author: &Author) -> Decision {
        self.chain(author)
            .into_iter()
            .find_map(|rule| {
                rule.underscore.map(|allowed| Decision {
                    allowed,
                    source: rule.source.clone(),
                })
            })
            .unwrap_or(Decision {
                allowed: false,
                source: RuleSource::Fallback,
            })
    }

    /// Resolved user references.
    pub fn references(&self) -> &BTreeMap<String, UserId> {
        &self.references
    }
}
