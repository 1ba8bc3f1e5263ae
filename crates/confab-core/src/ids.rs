//! Validated identifier strings.
//!
//! Every id that crosses a process or replica boundary is regex-checked on
//! parse, and serializes as its canonical string form. Time-ordered ids
//! (process, thread, message, channel) sort lexicographically in creation
//! order, which the rest of the system relies on.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::unique_id::{unique_id_from_datetime, unique_id_from_str, unique_id_random, BASE36_CHARS};

pub const NUM_CHARS_PROCESS_ID: usize = 24;
pub const NUM_CHARS_THREAD_ID: usize = 24;
pub const NUM_CHARS_MESSAGE_ID: usize = 28;
pub const NUM_CHARS_CHANNEL_ID: usize = 36;
pub const NUM_CHARS_SECRET: usize = 40;

const REGEX_UUID: &str = r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind}: '{value}'")]
pub struct IdError {
    pub kind: &'static str,
    pub value: String,
}

impl IdError {
    fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

fn full_match(pattern: &str) -> Regex {
    Regex::new(&format!("^(?:{pattern})$")).expect("static identifier regex")
}

/// Declare a newtype string id validated against a regex on parse.
macro_rules! validated_str {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $pattern:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                static RE: LazyLock<Regex> = LazyLock::new(|| full_match($pattern));
                if RE.is_match(s) {
                    Ok(Self(s.to_string()))
                } else {
                    Err(IdError::new($kind, s))
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = String::deserialize(deserializer)?;
                value.parse().map_err(de::Error::custom)
            }
        }
    };
}

/// Implement Display-based serde for a structured string type.
macro_rules! string_struct_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = String::deserialize(deserializer)?;
                value.parse().map_err(de::Error::custom)
            }
        }
    };
}

///
/// Agents
///

validated_str!(
    /// A human user: `user-<uuid>`.
    UserId,
    "UserId",
    r"user-[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}"
);

impl UserId {
    pub fn generate() -> Self {
        Self(format!("user-{}", Uuid::new_v4()))
    }

    pub fn uuid(&self) -> &str {
        &self.0["user-".len()..]
    }

    pub fn from_uuid(uuid: &str) -> Result<Self, IdError> {
        format!("user-{uuid}").parse()
    }
}

validated_str!(
    /// A chatbot identity within a workspace: `bot-<slug>`.
    BotId,
    "BotId",
    r"bot-[a-z0-9][a-z0-9-]*"
);

impl BotId {
    pub fn new(name: &str) -> Result<Self, IdError> {
        format!("bot-{name}").parse()
    }
}

validated_str!(
    /// An in-process service identity: `svc-<slug>`.
    ServiceId,
    "ServiceId",
    r"svc-[a-z0-9][a-z0-9-]*"
);

impl ServiceId {
    pub fn new(name: &str, suffix: Option<&str>) -> Result<Self, IdError> {
        match suffix {
            Some(suffix) => format!("svc-{name}-{suffix}").parse(),
            None => format!("svc-{name}").parse(),
        }
    }
}

/// Any message sender: a user, a bot, or an internal service.
///
/// The variant matters to the conversation history: text from users starts a
/// new task, text from services is transient scaffolding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AgentId {
    User(UserId),
    Bot(BotId),
    Service(ServiceId),
}

impl AgentId {
    pub fn is_user(&self) -> bool {
        matches!(self, AgentId::User(_))
    }

    pub fn is_service(&self) -> bool {
        matches!(self, AgentId::Service(_))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentId::User(id) => id.fmt(f),
            AgentId::Bot(id) => id.fmt(f),
            AgentId::Service(id) => id.fmt(f),
        }
    }
}

impl FromStr for AgentId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("user-") {
            Ok(AgentId::User(s.parse()?))
        } else if s.starts_with("bot-") {
            Ok(AgentId::Bot(s.parse()?))
        } else if s.starts_with("svc-") {
            Ok(AgentId::Service(s.parse()?))
        } else {
            Err(IdError::new("AgentId", s))
        }
    }
}

string_struct_serde!(AgentId);

impl From<UserId> for AgentId {
    fn from(id: UserId) -> Self {
        AgentId::User(id)
    }
}

impl From<BotId> for AgentId {
    fn from(id: BotId) -> Self {
        AgentId::Bot(id)
    }
}

impl From<ServiceId> for AgentId {
    fn from(id: ServiceId) -> Self {
        AgentId::Service(id)
    }
}

validated_str!(
    /// Correlates every process spawned while serving one client request.
    RequestId,
    "RequestId",
    r"req-[a-z0-9]{16,}"
);

impl RequestId {
    pub fn generate() -> Self {
        Self(format!("req-{}", unique_id_from_datetime(None, 16)))
    }
}

///
/// Secrets
///

validated_str!(
    /// Short-lived bearer secret granting update rights on a remote process.
    RemoteProcessSecret,
    "RemoteProcessSecret",
    r"rps-[a-z0-9]{40}"
);

impl RemoteProcessSecret {
    pub fn generate() -> Self {
        Self(format!("rps-{}", unique_id_random(NUM_CHARS_SECRET)))
    }
}

validated_str!(
    /// Short-lived bearer secret identifying a registered remote service.
    RemoteServiceSecret,
    "RemoteServiceSecret",
    r"rss-[a-z0-9]{40}"
);

impl RemoteServiceSecret {
    pub fn generate() -> Self {
        Self(format!("rss-{}", unique_id_random(NUM_CHARS_SECRET)))
    }
}

///
/// Scope & Workspace
///

const REGEX_SUFFIX: &str = r"default(?:-[a-z0-9][a-z0-9-]*)?|channel-[a-z0-9]{36}";

/// Trust and visibility domain of a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Cronjobs and internal applications; everything is public.
    Internal,
    /// A Microsoft-style group channel; access limited to group resources.
    MsGroup { group_id: String },
    /// A single user's privileged scope.
    Personal { user_id: String },
    /// A multi-participant private chat, keyed by a derived hash.
    Private { chat_id: String },
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Internal => f.write_str("internal"),
            Scope::MsGroup { group_id } => write!(f, "msgroup-{group_id}"),
            Scope::Personal { user_id } => write!(f, "personal-{user_id}"),
            Scope::Private { chat_id } => write!(f, "private-{chat_id}"),
        }
    }
}

impl FromStr for Scope {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static RE_UUID: LazyLock<Regex> = LazyLock::new(|| full_match(REGEX_UUID));
        static RE_PRIVATE: LazyLock<Regex> = LazyLock::new(|| full_match(r"[a-z0-9]{36}"));

        if s == "internal" {
            return Ok(Scope::Internal);
        }
        if let Some(group_id) = s.strip_prefix("msgroup-") {
            if RE_UUID.is_match(group_id) {
                return Ok(Scope::MsGroup {
                    group_id: group_id.to_string(),
                });
            }
        }
        if let Some(user_id) = s.strip_prefix("personal-") {
            if RE_UUID.is_match(user_id) {
                return Ok(Scope::Personal {
                    user_id: user_id.to_string(),
                });
            }
        }
        if let Some(chat_id) = s.strip_prefix("private-") {
            if RE_PRIVATE.is_match(chat_id) {
                return Ok(Scope::Private {
                    chat_id: chat_id.to_string(),
                });
            }
        }
        Err(IdError::new("Scope", s))
    }
}

string_struct_serde!(Scope);

/// The workspace suffix, partitioning a scope into conversations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkspaceSuffix {
    /// The single base conversation of a scope, optionally per release.
    Default { release: Option<String> },
    /// One of many conversations, keyed by a derived hash.
    Channel { channel_id: String },
}

impl fmt::Display for WorkspaceSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceSuffix::Default { release: None } => f.write_str("default"),
            WorkspaceSuffix::Default {
                release: Some(release),
            } => write!(f, "default-{release}"),
            WorkspaceSuffix::Channel { channel_id } => write!(f, "channel-{channel_id}"),
        }
    }
}

/// The unique id of a workspace: `ndw://{scope}/{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Workspace {
    pub scope: Scope,
    pub suffix: WorkspaceSuffix,
}

impl Workspace {
    pub fn new(scope: Scope, suffix: WorkspaceSuffix) -> Self {
        Self { scope, suffix }
    }

    /// Derive a channel workspace deterministically from a caller-chosen key.
    pub fn channel(scope: Scope, value: &str, environment: &str) -> Self {
        let channel_id = unique_id_from_str(
            value,
            NUM_CHARS_CHANNEL_ID,
            Some(&format!("confab-workspace-channel-{environment}")),
        );
        Self {
            scope,
            suffix: WorkspaceSuffix::Channel { channel_id },
        }
    }

    /// Path form used inside KV keys: `{scope}/{suffix}`.
    pub fn as_kv_path(&self) -> String {
        format!("{}/{}", self.scope, self.suffix)
    }

    pub fn as_suffix(&self) -> String {
        self.suffix.to_string()
    }
}

impl fmt::Display for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ndw://{}/{}", self.scope, self.suffix)
    }
}

impl FromStr for Workspace {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static RE_SUFFIX: LazyLock<Regex> = LazyLock::new(|| full_match(REGEX_SUFFIX));

        let path = s
            .strip_prefix("ndw://")
            .ok_or_else(|| IdError::new("Workspace", s))?;
        let (scope_str, suffix_str) = path
            .split_once('/')
            .ok_or_else(|| IdError::new("Workspace", s))?;

        let scope: Scope = scope_str.parse().map_err(|_| IdError::new("Workspace", s))?;
        if !RE_SUFFIX.is_match(suffix_str) {
            return Err(IdError::new("Workspace", s));
        }

        let suffix = if let Some(channel_id) = suffix_str.strip_prefix("channel-") {
            WorkspaceSuffix::Channel {
                channel_id: channel_id.to_string(),
            }
        } else if let Some(release) = suffix_str.strip_prefix("default-") {
            WorkspaceSuffix::Default {
                release: Some(release.to_string()),
            }
        } else {
            WorkspaceSuffix::Default { release: None }
        };

        Ok(Workspace { scope, suffix })
    }
}

string_struct_serde!(Workspace);

///
/// Processes
///

validated_str!(
    /// Machine name of a process protocol (an agent or tool), e.g. `web_search`.
    ProcessName,
    "ProcessName",
    r"[a-z][a-z0-9]+(?:_[a-z0-9]+)*"
);

validated_str!(
    /// The unique id of a process, also used as a tool call id.
    ///
    /// Generated ids are 24 lowercase base36 chars with the first 6 encoding
    /// the creation time, so listing processes yields temporal order. Vendor
    /// tool-call ids are normalized into this space via [`ProcessId::from_native`].
    ProcessId,
    "ProcessId",
    r"[a-z0-9]{24,}"
);

impl ProcessId {
    pub fn generate() -> Self {
        Self::generate_at(None)
    }

    pub fn generate_at(timestamp: Option<DateTime<Utc>>) -> Self {
        Self(unique_id_from_datetime(timestamp, NUM_CHARS_PROCESS_ID))
    }

    /// Convert a vendor tool-call id (OpenAI `call_…`, Anthropic `toolu_…`,
    /// Gemini UUIDs) into a process id.
    pub fn from_native(tool_call_id: &str) -> Result<Self, IdError> {
        let mut cleaned = tool_call_id
            .trim_start_matches("call_")
            .trim_start_matches("toolu_vrtx_")
            .trim_start_matches("toolu_")
            .replace('-', "")
            .to_lowercase();
        while cleaned.len() < NUM_CHARS_PROCESS_ID {
            cleaned.push('0');
        }
        cleaned.parse()
    }

    /// Fixed id for tests: twenty zeroes followed by a 4-char suffix.
    pub fn stub(suffix: &str) -> Self {
        assert!(suffix.len() <= 4);
        Self(format!("{:0>24}", suffix))
    }

    /// OpenAI wire form: `call_` + exactly 24 chars.
    pub fn as_native_openai(&self) -> String {
        let mut corrected = self.0.clone();
        corrected.truncate(NUM_CHARS_PROCESS_ID);
        while corrected.len() < NUM_CHARS_PROCESS_ID {
            corrected.push('0');
        }
        format!("call_{corrected}")
    }

    /// Anthropic wire form: `toolu_` + exactly 23 chars.
    pub fn as_native_anthropic(&self) -> String {
        let mut corrected = self.0.clone();
        corrected.truncate(23);
        while corrected.len() < 23 {
            corrected.push('0');
        }
        format!("toolu_{corrected}")
    }

    /// Gemini wire form: a UUID, derived deterministically by mapping base36
    /// digits onto hex digits.
    pub fn as_native_gemini(&self) -> String {
        let mut corrected = self.0.clone();
        corrected.truncate(32);
        while corrected.len() < 32 {
            corrected.push('0');
        }

        const HEX: &[u8; 16] = b"0123456789abcdef";
        let hex: String = corrected
            .bytes()
            .map(|b| {
                let index = BASE36_CHARS.iter().position(|c| *c == b).unwrap_or(0);
                HEX[index % 16] as char
            })
            .collect();

        format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

/// The URI of a process: workspace, chain of parent process ids, own id.
///
/// `ndp://{scope}/{workspace_suffix}(/{process_id})+`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessUri {
    pub workspace: Workspace,
    pub parent_ids: Vec<ProcessId>,
    pub process_id: ProcessId,
}

impl ProcessUri {
    pub fn root(workspace: Workspace, process_id: ProcessId) -> Self {
        Self {
            workspace,
            parent_ids: Vec::new(),
            process_id,
        }
    }

    pub fn stub(suffix: &str) -> Self {
        let process_id = ProcessId::stub(suffix);
        format!("ndp://internal/default-unit-test/{process_id}")
            .parse()
            .expect("stub process uri")
    }

    pub fn child(&self, child_process_id: ProcessId) -> Self {
        let mut parent_ids = self.parent_ids.clone();
        parent_ids.push(self.process_id.clone());
        Self {
            workspace: self.workspace.clone(),
            parent_ids,
            process_id: child_process_id,
        }
    }

    pub fn parent(&self) -> Option<Self> {
        let (last, rest) = self.parent_ids.split_last()?;
        Some(Self {
            workspace: self.workspace.clone(),
            parent_ids: rest.to_vec(),
            process_id: last.clone(),
        })
    }

    pub fn as_kv_path(&self) -> String {
        let mut path = self.workspace.as_kv_path();
        for id in &self.parent_ids {
            path.push('/');
            path.push_str(id.as_str());
        }
        path.push('/');
        path.push_str(self.process_id.as_str());
        path
    }
}

impl fmt::Display for ProcessUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ndp://{}", self.as_kv_path())
    }
}

impl FromStr for ProcessUri {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = s
            .strip_prefix("ndp://")
            .ok_or_else(|| IdError::new("ProcessUri", s))?;
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() < 3 {
            return Err(IdError::new("ProcessUri", s));
        }

        let workspace: Workspace = format!("ndw://{}/{}", segments[0], segments[1])
            .parse()
            .map_err(|_| IdError::new("ProcessUri", s))?;
        let mut ids: Vec<ProcessId> = Vec::new();
        for segment in &segments[2..] {
            ids.push(segment.parse().map_err(|_| IdError::new("ProcessUri", s))?);
        }
        let process_id = ids.pop().expect("at least one process id");

        Ok(ProcessUri {
            workspace,
            parent_ids: ids,
            process_id,
        })
    }
}

string_struct_serde!(ProcessUri);

///
/// Threads
///

validated_str!(
    /// Time-ordered thread id, prefixed `thread-`.
    ThreadId,
    "ThreadId",
    r"thread-[a-z0-9]{24,}"
);

impl ThreadId {
    pub fn generate() -> Self {
        Self(format!(
            "thread-{}",
            unique_id_from_datetime(None, NUM_CHARS_THREAD_ID)
        ))
    }

    /// Derive a stable thread id from a client conversation key.
    pub fn conversation(workspace: &Workspace, conversation_id: &str, environment: &str) -> Self {
        let unique_id = unique_id_from_str(
            &format!("{workspace}/{conversation_id}"),
            NUM_CHARS_THREAD_ID,
            Some(&format!("confab-thread-{environment}")),
        );
        Self(format!("thread-{unique_id}"))
    }
}

validated_str!(
    /// Time-ordered message id within a thread, prefixed `msg-`.
    MessageId,
    "MessageId",
    r"msg-[a-z0-9]{28,}"
);

impl MessageId {
    pub fn generate() -> Self {
        Self::generate_at(None)
    }

    pub fn generate_at(timestamp: Option<DateTime<Utc>>) -> Self {
        Self(format!(
            "msg-{}",
            unique_id_from_datetime(timestamp, NUM_CHARS_MESSAGE_ID)
        ))
    }
}

/// The URI of a thread: `nkt://{scope}/{workspace_suffix}/{thread_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadUri {
    pub workspace: Workspace,
    pub thread_id: ThreadId,
}

impl ThreadUri {
    pub fn new(workspace: Workspace, thread_id: ThreadId) -> Self {
        Self {
            workspace,
            thread_id,
        }
    }

    pub fn as_kv_path(&self) -> String {
        format!("{}/{}", self.workspace.as_kv_path(), self.thread_id)
    }

    pub fn cursor(&self, last_message_id: MessageId) -> ThreadCursor {
        ThreadCursor {
            workspace: self.workspace.clone(),
            thread_id: self.thread_id.clone(),
            last_message_id,
        }
    }
}

impl fmt::Display for ThreadUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nkt://{}", self.as_kv_path())
    }
}

impl FromStr for ThreadUri {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = s
            .strip_prefix("nkt://")
            .ok_or_else(|| IdError::new("ThreadUri", s))?;
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() != 3 {
            return Err(IdError::new("ThreadUri", s));
        }
        let workspace: Workspace = format!("ndw://{}/{}", segments[0], segments[1])
            .parse()
            .map_err(|_| IdError::new("ThreadUri", s))?;
        let thread_id: ThreadId = segments[2]
            .parse()
            .map_err(|_| IdError::new("ThreadUri", s))?;
        Ok(ThreadUri {
            workspace,
            thread_id,
        })
    }
}

string_struct_serde!(ThreadUri);

/// A cursor pinning the last message a consumer has seen in a thread:
/// `nkt://{scope}/{workspace_suffix}/{thread_id}/{last_message_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadCursor {
    pub workspace: Workspace,
    pub thread_id: ThreadId,
    pub last_message_id: MessageId,
}

impl ThreadCursor {
    pub fn thread_uri(&self) -> ThreadUri {
        ThreadUri {
            workspace: self.workspace.clone(),
            thread_id: self.thread_id.clone(),
        }
    }
}

impl fmt::Display for ThreadCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.thread_uri(),
            self.last_message_id
        )
    }
}

impl FromStr for ThreadCursor {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (uri_str, message_str) = s
            .rsplit_once('/')
            .ok_or_else(|| IdError::new("ThreadCursor", s))?;
        let uri: ThreadUri = uri_str.parse().map_err(|_| IdError::new("ThreadCursor", s))?;
        let last_message_id: MessageId = message_str
            .parse()
            .map_err(|_| IdError::new("ThreadCursor", s))?;
        Ok(ThreadCursor {
            workspace: uri.workspace,
            thread_id: uri.thread_id,
            last_message_id,
        })
    }
}

string_struct_serde!(ThreadCursor);

///
/// Channels
///

validated_str!(
    /// Cross-replica response channel id, prefixed `wch-`.
    ChannelId,
    "ChannelId",
    r"wch-[a-z0-9]{36}"
);

impl ChannelId {
    pub fn generate() -> Self {
        Self(format!(
            "wch-{}",
            unique_id_from_datetime(None, NUM_CHARS_CHANNEL_ID)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parses_all_literals() {
        let cases = [
            "internal",
            "msgroup-00000000-0000-0000-0000-000000000000",
            "personal-54916b77-a320-4496-a8f6-f4ce7ab46fc8",
            "private-0123456789abcdefghijklmnopqrstuvwxyz",
        ];
        for case in cases {
            let scope: Scope = case.parse().unwrap();
            assert_eq!(scope.to_string(), case);
        }
        assert!("msgroup-not-a-uuid".parse::<Scope>().is_err());
        assert!("public".parse::<Scope>().is_err());
    }

    #[test]
    fn workspace_round_trips() {
        let cases = [
            "ndw://internal/default-unit-test",
            "ndw://personal-54916b77-a320-4496-a8f6-f4ce7ab46fc8/default",
            "ndw://msgroup-00000000-0000-0000-0000-000000000000/channel-0123456789abcdefghijklmnopqrstuvwxyz",
        ];
        for case in cases {
            let ws: Workspace = case.parse().unwrap();
            assert_eq!(ws.to_string(), case);
        }
        assert_eq!(
            "ndw://internal/default-unit-test"
                .parse::<Workspace>()
                .unwrap()
                .as_kv_path(),
            "internal/default-unit-test"
        );
    }

    #[test]
    fn process_id_generation_is_time_ordered() {
        let a = ProcessId::generate();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let b = ProcessId::generate();
        assert!(a < b);
        assert_eq!(a.as_str().len(), 24);
    }

    #[test]
    fn process_id_native_conversions() {
        let id = ProcessId::from_native("call_AbCd1234").unwrap();
        assert!(id.as_str().starts_with("abcd1234"));
        assert_eq!(id.as_str().len(), 24);

        let openai = ProcessId::stub("7").as_native_openai();
        assert_eq!(openai, "call_000000000000000000000007");

        let gemini = ProcessId::stub("7").as_native_gemini();
        assert_eq!(gemini.len(), 36);
        assert_eq!(gemini.matches('-').count(), 4);
    }

    #[test]
    fn process_uri_child_and_parent() {
        let uri: ProcessUri = "ndp://internal/default-unit-test/000000000000000000000001"
            .parse()
            .unwrap();
        assert!(uri.parent().is_none());

        let child = uri.child(ProcessId::stub("2"));
        assert_eq!(
            child.to_string(),
            "ndp://internal/default-unit-test/000000000000000000000001/000000000000000000000002"
        );
        assert_eq!(child.parent().unwrap(), uri);
    }

    #[test]
    fn thread_cursor_round_trips() {
        let cursor_str = "nkt://internal/default-unit-test/thread-9e7xc0000123456789abcdef/msg-9e7xc00123456789abcdef012345";
        let cursor: ThreadCursor = cursor_str.parse().unwrap();
        assert_eq!(cursor.to_string(), cursor_str);
        assert_eq!(
            cursor.thread_uri().to_string(),
            "nkt://internal/default-unit-test/thread-9e7xc0000123456789abcdef"
        );
    }

    #[test]
    fn agent_id_dispatches_on_prefix() {
        let user: AgentId = "user-54916b77-a320-4496-a8f6-f4ce7ab46fc8".parse().unwrap();
        assert!(user.is_user());
        let svc: AgentId = "svc-llm-tools".parse().unwrap();
        assert!(svc.is_service());
        let bot: AgentId = "bot-helper".parse().unwrap();
        assert!(!bot.is_user() && !bot.is_service());
    }

    #[test]
    fn channel_id_format() {
        let id = ChannelId::generate();
        assert!(id.as_str().starts_with("wch-"));
        assert_eq!(id.as_str().len(), 40);
    }
}
