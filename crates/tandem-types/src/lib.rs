//! # tandem-types: Core types for `Tandem`
//!
//! This crate contains shared types used across the HA pair:
//! - Node identity ([`NodeSlot`], [`NodeIdentity`])
//! - Role and health ([`HaStatus`], [`DisabledReason`], [`DisabledReasons`])
//! - Persisted failover settings ([`HaConfig`], [`HaConfigUpdate`], [`HaConfigView`])
//! - Replicated configuration writes ([`SqlParam`], [`JournalGeneration`], [`WriteSequence`])
//! - Encryption material ([`EncryptionKeys`], [`KeyEntry`], [`KmipKey`])
//! - Platform observations ([`PoolInfo`], [`InterfaceInfo`], [`VrrpState`], [`VrrpSnapshot`])
//! - Service control ([`ServiceVerb`], [`ServiceOptions`])
//! - Background alerts ([`AlertKind`]) and error codes ([`Errno`])
//! - Upgrade jobs ([`BootEnvironment`], [`JobId`], [`JobState`])

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Node Identity
// ============================================================================

/// Physical slot of a controller in the chassis.
///
/// Probed from hardware at boot and immutable for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeSlot {
    A,
    B,
    /// Slot position could not be determined.
    #[serde(rename = "MANUAL")]
    Manual,
}

impl NodeSlot {
    /// Returns the slot on the other side of the interlink.
    ///
    /// `Manual` has no well-defined peer.
    pub fn peer(self) -> Option<NodeSlot> {
        match self {
            NodeSlot::A => Some(NodeSlot::B),
            NodeSlot::B => Some(NodeSlot::A),
            NodeSlot::Manual => None,
        }
    }

    /// Single-character form stored in the failover config row.
    pub fn as_char(self) -> char {
        match self {
            NodeSlot::A => 'A',
            NodeSlot::B => 'B',
            NodeSlot::Manual => 'M',
        }
    }
}

impl Display for NodeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeSlot::A => write!(f, "A"),
            NodeSlot::B => write!(f, "B"),
            NodeSlot::Manual => write!(f, "MANUAL"),
        }
    }
}

impl FromStr for NodeSlot {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(NodeSlot::A),
            "B" => Ok(NodeSlot::B),
            "MANUAL" | "M" => Ok(NodeSlot::Manual),
            other => Err(ParseError::new("node slot", other)),
        }
    }
}

/// Identity of the local controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub slot: NodeSlot,
    /// Whether the appliance is licensed for HA.
    pub licensed: bool,
}

impl NodeIdentity {
    pub fn new(slot: NodeSlot, licensed: bool) -> Self {
        Self { slot, licensed }
    }
}

// ============================================================================
// Role and Health
// ============================================================================

/// Role of the local node as observed by the role engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HaStatus {
    /// Not licensed for HA, or not configured as a pair.
    Single,
    Master,
    Backup,
    /// Transiently entered while a failover event decides the new role.
    Electing,
    /// Pool import in progress after winning an election.
    Importing,
    Error,
    Unknown,
}

impl HaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HaStatus::Single => "SINGLE",
            HaStatus::Master => "MASTER",
            HaStatus::Backup => "BACKUP",
            HaStatus::Electing => "ELECTING",
            HaStatus::Importing => "IMPORTING",
            HaStatus::Error => "ERROR",
            HaStatus::Unknown => "UNKNOWN",
        }
    }

    /// True for roles that own the configuration database.
    pub fn owns_database(self) -> bool {
        matches!(self, HaStatus::Master | HaStatus::Single)
    }
}

impl Display for HaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HaStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SINGLE" => Ok(HaStatus::Single),
            "MASTER" => Ok(HaStatus::Master),
            "BACKUP" => Ok(HaStatus::Backup),
            "ELECTING" => Ok(HaStatus::Electing),
            "IMPORTING" => Ok(HaStatus::Importing),
            "ERROR" => Ok(HaStatus::Error),
            "UNKNOWN" => Ok(HaStatus::Unknown),
            other => Err(ParseError::new("HA status", other)),
        }
    }
}

/// A reason why failover is currently unsafe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisabledReason {
    /// No pool is configured.
    NoVolume,
    /// No interface advertises a virtual alias.
    NoVip,
    /// The peer has not finished booting.
    NoSystemReady,
    /// The peer did not answer.
    NoPong,
    /// Failover is administratively disabled.
    NoFailover,
    /// The peer is not licensed for HA.
    NoLicense,
    /// Local and peer VRRP roles are incompatible.
    DisagreeCarp,
    /// Data-disk serials differ between the controllers.
    MismatchDisks,
    /// No interface is marked critical for failover.
    NoCriticalInterfaces,
}

impl DisabledReason {
    pub const ALL: [DisabledReason; 9] = [
        DisabledReason::NoVolume,
        DisabledReason::NoVip,
        DisabledReason::NoSystemReady,
        DisabledReason::NoPong,
        DisabledReason::NoFailover,
        DisabledReason::NoLicense,
        DisabledReason::DisagreeCarp,
        DisabledReason::MismatchDisks,
        DisabledReason::NoCriticalInterfaces,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DisabledReason::NoVolume => "NO_VOLUME",
            DisabledReason::NoVip => "NO_VIP",
            DisabledReason::NoSystemReady => "NO_SYSTEM_READY",
            DisabledReason::NoPong => "NO_PONG",
            DisabledReason::NoFailover => "NO_FAILOVER",
            DisabledReason::NoLicense => "NO_LICENSE",
            DisabledReason::DisagreeCarp => "DISAGREE_CARP",
            DisabledReason::MismatchDisks => "MISMATCH_DISKS",
            DisabledReason::NoCriticalInterfaces => "NO_CRITICAL_INTERFACES",
        }
    }
}

impl Display for DisabledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of reasons failover is unsafe. Empty means healthy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisabledReasons(BTreeSet<DisabledReason>);

impl DisabledReasons {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reason: DisabledReason) -> bool {
        self.0.insert(reason)
    }

    pub fn contains(&self, reason: DisabledReason) -> bool {
        self.0.contains(&reason)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = DisabledReason> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<DisabledReason> for DisabledReasons {
    fn from_iter<T: IntoIterator<Item = DisabledReason>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Display for DisabledReasons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(DisabledReason::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

// ============================================================================
// Failover Settings
// ============================================================================

/// Persisted failover settings (single row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaConfig {
    /// Administrative kill-switch.
    pub disabled: bool,
    /// Slot configured as the preferred MASTER.
    pub master_slot: NodeSlot,
    /// Debounce before a critical-interface event escalates to failover.
    pub timeout_seconds: u32,
}

impl HaConfig {
    pub const DEFAULT_TIMEOUT_SECONDS: u32 = 2;

    /// Presents the row from the point of view of `local`.
    pub fn view(&self, local: NodeSlot) -> HaConfigView {
        HaConfigView {
            disabled: self.disabled,
            timeout: self.timeout_seconds,
            master: self.master_slot == local,
        }
    }
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            master_slot: NodeSlot::A,
            timeout_seconds: Self::DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

/// Failover settings as returned to callers: `master` is relative to the caller's node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaConfigView {
    pub disabled: bool,
    pub timeout: u32,
    pub master: bool,
}

/// Partial update of [`HaConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaConfigUpdate {
    pub disabled: Option<bool>,
    /// `Some(true)` makes the calling node the configured MASTER.
    pub master: Option<bool>,
    pub timeout: Option<u32>,
}

// ============================================================================
// Replicated Configuration Writes
// ============================================================================

/// A bound parameter of a configuration-database statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlParam {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Integer(value)
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Integer(i64::from(value))
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Real(value)
    }
}

impl From<Vec<u8>> for SqlParam {
    fn from(value: Vec<u8>) -> Self {
        SqlParam::Blob(value)
    }
}

/// Identifies one lineage of replicated writes.
///
/// A new generation is minted whenever a journal is created from scratch or
/// the MASTER pushes the whole database, so sequence numbers only need to be
/// monotonic within a generation. Generations are ordered by minting time:
/// the high bits hold milliseconds since the epoch, the low 16 bits are
/// random.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JournalGeneration(u64);

impl JournalGeneration {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Mints a generation newer than any minted before on this clock.
    pub fn mint() -> Self {
        Self::mint_after(None)
    }

    /// Mints a generation strictly greater than `floor`, even if the clock
    /// went backwards.
    pub fn mint_after(floor: Option<JournalGeneration>) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let candidate = (millis << 16) | u64::from(rand::random::<u16>());
        match floor {
            Some(floor) if candidate <= floor.0 => Self(floor.0.saturating_add(1)),
            _ => Self(candidate),
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for JournalGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen:{:016x}", self.0)
    }
}

/// Position of a write within its [`JournalGeneration`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct WriteSequence(u64);

impl WriteSequence {
    pub const ZERO: WriteSequence = WriteSequence(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        WriteSequence(self.0.saturating_add(1))
    }
}

impl Display for WriteSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

// ============================================================================
// Encryption Material
// ============================================================================

/// A `(name, passphrase)` pair for a pool or dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub name: String,
    pub passphrase: String,
}

impl KeyEntry {
    pub fn new(name: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passphrase: passphrase.into(),
        }
    }
}

/// Cached encryption passphrases the standby needs after a takeover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKeys {
    /// Legacy pool-level keys.
    pub geli: BTreeMap<String, String>,
    /// Dataset passphrases.
    pub zfs: BTreeMap<String, String>,
}

impl EncryptionKeys {
    pub fn is_empty(&self) -> bool {
        self.geli.is_empty() && self.zfs.is_empty()
    }

    /// Keys for `pool` itself and every dataset below it.
    pub fn zfs_keys_for_pool(&self, pool: &str) -> Vec<KeyEntry> {
        let prefix = format!("{pool}/");
        self.zfs
            .iter()
            .filter(|(name, _)| name.as_str() == pool || name.starts_with(&prefix))
            .map(|(name, passphrase)| KeyEntry::new(name.clone(), passphrase.clone()))
            .collect()
    }
}

/// A KMIP-managed secret held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KmipKey {
    pub id: String,
    pub secret: String,
}

// ============================================================================
// Platform Observations
// ============================================================================

/// A configured storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub guid: String,
    /// Whether the pool is imported on the reporting node.
    pub imported: bool,
}

/// VRRP (or CARP) state of a failover interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VrrpState {
    Master,
    Backup,
    Init,
}

/// A network interface as seen by the failover engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    /// A state change on this interface can trigger failover.
    pub critical: bool,
    /// Virtual addresses advertised by whichever node is MASTER.
    pub virtual_aliases: Vec<String>,
    /// `None` when the interface carries no VRRP configuration.
    pub vrrp: Option<VrrpState>,
    /// Part of the point-to-point interlink.
    pub internal: bool,
}

/// VRRP roles of the critical, non-internal interfaces of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrrpSnapshot {
    pub masters: BTreeSet<String>,
    pub backups: BTreeSet<String>,
    pub inits: BTreeSet<String>,
}

impl VrrpSnapshot {
    /// Builds the snapshot from an interface listing.
    pub fn from_interfaces(interfaces: &[InterfaceInfo]) -> Self {
        let mut snapshot = VrrpSnapshot::default();
        for iface in interfaces.iter().filter(|i| i.critical && !i.internal) {
            match iface.vrrp {
                Some(VrrpState::Master) => {
                    snapshot.masters.insert(iface.name.clone());
                }
                Some(VrrpState::Backup) => {
                    snapshot.backups.insert(iface.name.clone());
                }
                Some(VrrpState::Init) => {
                    snapshot.inits.insert(iface.name.clone());
                }
                None => {}
            }
        }
        snapshot
    }

    fn configured(&self) -> BTreeSet<&String> {
        self.masters.iter().chain(self.backups.iter()).collect()
    }

    /// Lists every incompatibility between a local and a remote snapshot.
    ///
    /// An empty result means both nodes agree on the per-interface roles.
    pub fn disagreements(local: &VrrpSnapshot, remote: &VrrpSnapshot) -> Vec<String> {
        let mut errors = Vec::new();
        let local_configured = local.configured();
        let remote_configured = remote.configured();
        let interfaces: BTreeSet<&String> =
            local_configured.union(&remote_configured).copied().collect();

        if interfaces.is_empty() {
            errors.push("There are no failover interfaces".to_string());
        }
        for name in interfaces {
            if !local_configured.contains(name) {
                errors.push(format!(
                    "Interface {name} is not configured for failover on local system"
                ));
            }
            if !remote_configured.contains(name) {
                errors.push(format!(
                    "Interface {name} is not configured for failover on remote system"
                ));
            }
            if local.masters.contains(name) && remote.masters.contains(name) {
                errors.push(format!("Interface {name} is MASTER on both nodes"));
            }
            if local.backups.contains(name) && remote.backups.contains(name) {
                errors.push(format!("Interface {name} is BACKUP on both nodes"));
            }
        }
        for name in local.inits.union(&remote.inits) {
            if !local.inits.contains(name) {
                errors.push(format!(
                    "Interface {name} is in a non-functioning state on local system"
                ));
            }
            if !remote.inits.contains(name) {
                errors.push(format!(
                    "Interface {name} is in a non-functioning state on remote system"
                ));
            }
        }
        errors
    }
}

// ============================================================================
// Service Control
// ============================================================================

/// A service control verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceVerb {
    Start,
    Stop,
    Restart,
    Reload,
}

impl ServiceVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceVerb::Start => "start",
            ServiceVerb::Stop => "stop",
            ServiceVerb::Restart => "restart",
            ServiceVerb::Reload => "reload",
        }
    }
}

impl Display for ServiceVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options accompanying a service verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOptions {
    /// Mirror the action on the standby when running on MASTER.
    pub ha_propagate: bool,
}

impl ServiceOptions {
    /// Options for actions the failover engine performs itself on each node.
    pub const LOCAL_ONLY: ServiceOptions = ServiceOptions {
        ha_propagate: false,
    };
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self { ha_propagate: true }
    }
}

// ============================================================================
// Key Cache Requests
// ============================================================================

/// Keys to merge into the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUpdate {
    pub pools: Vec<KeyEntry>,
    pub datasets: Vec<KeyEntry>,
    /// Push the resulting cache to the standby before returning.
    pub sync_keys: bool,
}

/// Names to drop from the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRemoval {
    pub pools: Vec<String>,
    pub datasets: Vec<String>,
    pub sync_keys: bool,
}

// ============================================================================
// Upgrades
// ============================================================================

/// A boot environment known to the boot loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootEnvironment {
    pub id: String,
    /// Currently booted.
    pub active: bool,
    /// Selected for the next boot.
    pub activated: bool,
}

/// Handle of a long-running job on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job:{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Running { percent: u8, description: String },
    Success,
    Failed(String),
}

impl JobState {
    /// Completion in percent; finished jobs report 100.
    pub fn percent(&self) -> u8 {
        match self {
            JobState::Running { percent, .. } => (*percent).min(100),
            JobState::Success | JobState::Failed(_) => 100,
        }
    }
}

/// Administrative failover toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlAction {
    Enable,
    Disable,
}

// ============================================================================
// Error Codes
// ============================================================================

/// Stable error codes carried by failed calls, local or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Errno {
    /// Operation not permitted on this node or for this caller.
    Eperm,
    Enoent,
    Eagain,
    Ebusy,
    Einval,
    Efault,
    Etimedout,
    Econnrefused,
    Ehostdown,
    /// Unknown remote method.
    Enomethod,
}

impl Errno {
    pub fn as_str(self) -> &'static str {
        match self {
            Errno::Eperm => "EPERM",
            Errno::Enoent => "ENOENT",
            Errno::Eagain => "EAGAIN",
            Errno::Ebusy => "EBUSY",
            Errno::Einval => "EINVAL",
            Errno::Efault => "EFAULT",
            Errno::Etimedout => "ETIMEDOUT",
            Errno::Econnrefused => "ECONNREFUSED",
            Errno::Ehostdown => "EHOSTDOWN",
            Errno::Enomethod => "ENOMETHOD",
        }
    }
}

impl Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Alerts
// ============================================================================

/// One-shot alerts raised by background HA work. Each clears itself on the
/// next success of the operation that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    /// Replaying a journal entry on the standby failed.
    FailoverSyncFailed,
    FailoverKeysSyncFailed,
    FailoverKmipKeysSyncFailed,
    /// The standby runs a different software version.
    RemoteVersionMismatch,
    /// The standby's software version could not be read.
    RemoteVersionUnknown,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::FailoverSyncFailed => "FailoverSyncFailed",
            AlertKind::FailoverKeysSyncFailed => "FailoverKeysSyncFailed",
            AlertKind::FailoverKmipKeysSyncFailed => "FailoverKMIPKeysSyncFailed",
            AlertKind::RemoteVersionMismatch => "RemoteVersionMismatch",
            AlertKind::RemoteVersionUnknown => "RemoteVersionUnknown",
        }
    }
}

impl Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Failure to parse one of the textual forms in this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    what: &'static str,
    input: String,
}

impl ParseError {
    fn new(what: &'static str, input: &str) -> Self {
        Self {
            what,
            input: input.to_string(),
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.what, self.input)
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn iface(name: &str, vrrp: Option<VrrpState>) -> InterfaceInfo {
        InterfaceInfo {
            name: name.to_string(),
            critical: true,
            virtual_aliases: vec!["10.0.0.10".to_string()],
            vrrp,
            internal: false,
        }
    }

    #[test]
    fn test_slot_peer() {
        assert_eq!(NodeSlot::A.peer(), Some(NodeSlot::B));
        assert_eq!(NodeSlot::B.peer(), Some(NodeSlot::A));
        assert_eq!(NodeSlot::Manual.peer(), None);
    }

    #[test_case("a", NodeSlot::A)]
    #[test_case("B", NodeSlot::B)]
    #[test_case("manual", NodeSlot::Manual)]
    fn test_slot_parse(input: &str, expected: NodeSlot) {
        assert_eq!(input.parse::<NodeSlot>().unwrap(), expected);
    }

    #[test]
    fn test_status_serde_uses_wire_names() {
        let json = serde_json::to_string(&HaStatus::Importing).unwrap();
        assert_eq!(json, "\"IMPORTING\"");
        let back: HaStatus = serde_json::from_str("\"BACKUP\"").unwrap();
        assert_eq!(back, HaStatus::Backup);
        assert_eq!("ELECTING".parse::<HaStatus>().unwrap(), HaStatus::Electing);
    }

    #[test]
    fn test_disabled_reasons_serialize_as_list() {
        let reasons: DisabledReasons = [DisabledReason::NoPong, DisabledReason::NoVolume]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&reasons).unwrap();
        assert_eq!(json, "[\"NO_VOLUME\",\"NO_PONG\"]");
        assert_eq!(reasons.to_string(), "[NO_VOLUME, NO_PONG]");
    }

    #[test]
    fn test_config_view_is_relative_to_caller() {
        let config = HaConfig {
            disabled: false,
            master_slot: NodeSlot::B,
            timeout_seconds: 2,
        };
        assert!(config.view(NodeSlot::B).master);
        assert!(!config.view(NodeSlot::A).master);
    }

    #[test]
    fn test_zfs_keys_for_pool_matches_children_only() {
        let mut keys = EncryptionKeys::default();
        keys.zfs.insert("tank".into(), "p0".into());
        keys.zfs.insert("tank/enc".into(), "p1".into());
        keys.zfs.insert("tanker/enc".into(), "p2".into());

        let names: Vec<String> = keys
            .zfs_keys_for_pool("tank")
            .into_iter()
            .map(|k| k.name)
            .collect();
        assert_eq!(names, vec!["tank".to_string(), "tank/enc".to_string()]);
    }

    #[test]
    fn test_vrrp_agreement() {
        let local = VrrpSnapshot::from_interfaces(&[iface("eno1", Some(VrrpState::Master))]);
        let remote = VrrpSnapshot::from_interfaces(&[iface("eno1", Some(VrrpState::Backup))]);
        assert!(VrrpSnapshot::disagreements(&local, &remote).is_empty());
    }

    #[test]
    fn test_vrrp_master_on_both_nodes() {
        let local = VrrpSnapshot::from_interfaces(&[iface("eno1", Some(VrrpState::Master))]);
        let remote = VrrpSnapshot::from_interfaces(&[iface("eno1", Some(VrrpState::Master))]);
        let errors = VrrpSnapshot::disagreements(&local, &remote);
        assert_eq!(errors, vec!["Interface eno1 is MASTER on both nodes".to_string()]);
    }

    #[test]
    fn test_vrrp_missing_and_init() {
        let local = VrrpSnapshot::from_interfaces(&[
            iface("eno1", Some(VrrpState::Master)),
            iface("eno2", Some(VrrpState::Init)),
        ]);
        let remote = VrrpSnapshot::from_interfaces(&[]);
        let errors = VrrpSnapshot::disagreements(&local, &remote);
        assert!(errors.iter().any(|e| e.contains("eno1 is not configured for failover on remote")));
        assert!(errors.iter().any(|e| e.contains("eno2 is in a non-functioning state on remote")));
    }

    #[test]
    fn test_vrrp_ignores_internal_and_noncritical() {
        let mut internal = iface("ntb0", Some(VrrpState::Master));
        internal.internal = true;
        let mut lan = iface("eno3", Some(VrrpState::Master));
        lan.critical = false;
        let snapshot = VrrpSnapshot::from_interfaces(&[internal, lan]);
        assert_eq!(snapshot, VrrpSnapshot::default());
    }

    #[test]
    fn test_sequence_next_saturates() {
        assert_eq!(WriteSequence::new(u64::MAX).next(), WriteSequence::new(u64::MAX));
        assert_eq!(WriteSequence::ZERO.next(), WriteSequence::new(1));
    }

    #[test]
    fn test_generation_mint_is_ordered() {
        let first = JournalGeneration::mint();
        let second = JournalGeneration::mint_after(Some(first));
        assert!(second > first);

        // A floor from the future still yields a newer generation.
        let future = JournalGeneration::new(u64::MAX - 1);
        assert_eq!(
            JournalGeneration::mint_after(Some(future)),
            JournalGeneration::new(u64::MAX)
        );
    }
}
