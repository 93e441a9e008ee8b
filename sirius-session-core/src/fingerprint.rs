use ahash::AHasher;
use std::hash::Hasher;

// Domain separation so a prefix hash can never collide with a message digest
// computed over the same bytes.
const DOMAIN_PREFIX: u8 = 1;
const DOMAIN_MESSAGE: u8 = 2;

/// Inputs that identify a logical client session. Two requests with the same
/// fingerprint must hash to the same prefix, so every field is written in a
/// fixed order with length framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFingerprint<'a> {
    pub user: &'a str,
    pub api_key: &'a str,
    pub ip: &'a str,
    pub user_agent: &'a str,
    pub platform: &'a str,
    pub model: &'a str,
}

impl SessionFingerprint<'_> {
    pub fn prefix_hash(&self) -> u64 {
        session_prefix_hash(
            self.user,
            self.api_key,
            self.ip,
            self.user_agent,
            self.platform,
            self.model,
        )
    }
}

pub fn session_prefix_hash(
    user: &str,
    api_key: &str,
    ip: &str,
    user_agent: &str,
    platform: &str,
    model: &str,
) -> u64 {
    let mut hasher = AHasher::default();
    hasher.write_u8(DOMAIN_PREFIX);
    for field in [user, api_key, ip, user_agent, platform, model] {
        hasher.write_u64(field.len() as u64);
        hasher.write(field.as_bytes());
    }
    hasher.finish()
}

/// Short role-tagged digest of one message, e.g. `u:1f3a9c02`.
///
/// Roles map to one-letter tags: system → `s`, user → `u`, anything
/// model-side (`assistant`/`model`) → `m`, tool traffic → `t`.
pub fn message_digest(role: &str, content: &str) -> String {
    let tag = match role {
        "system" => 's',
        "user" => 'u',
        "assistant" | "model" => 'm',
        "tool" => 't',
        _ => 'x',
    };

    let mut hasher = AHasher::default();
    hasher.write_u8(DOMAIN_MESSAGE);
    hasher.write(content.as_bytes());
    let short = (hasher.finish() & 0xffff_ffff) as u32;
    format!("{tag}:{short:08x}")
}

/// Digest chain over a conversation: one tagged digest per message, joined
/// with `-` when rendered. Returned as segments so callers can probe chain
/// prefixes from longest to shortest.
pub fn digest_chain<'a, I>(messages: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    messages
        .into_iter()
        .map(|(role, content)| message_digest(role, content))
        .collect()
}
