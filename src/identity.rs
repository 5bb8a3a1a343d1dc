//! Session/identity boundary.
//!
//! Session tokens are `<user_id>.<hex(HMAC-SHA256(secret, user_id))>`. The
//! account service that checks passwords issues them with
//! [`SessionKeys::issue`]; every request resolves its token back to a
//! [`UserId`] with [`SessionKeys::resolve`]. Nothing else about the user is
//! known here.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use kbchat_core::{Error, Result, UserId};

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted secret length in bytes.
const MIN_SECRET_LEN: usize = 16;

#[derive(Clone)]
pub struct SessionKeys {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

impl SessionKeys {
    pub fn new(secret: impl Into<Vec<u8>>) -> anyhow::Result<Self> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            anyhow::bail!(
                "session secret must be at least {} bytes long",
                MIN_SECRET_LEN
            );
        }
        Ok(Self { secret })
    }

    /// Read the secret from the environment variable `var`.
    pub fn from_env(var: &str) -> anyhow::Result<Self> {
        let secret = std::env::var(var)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", var))?;
        Self::new(secret.into_bytes())
    }

    fn mac(&self) -> HmacSha256 {
        <HmacSha256 as Mac>::new_from_slice(&self.secret).expect("HMAC can take key of any size")
    }

    pub fn issue(&self, user: &UserId) -> String {
        let mut mac = self.mac();
        mac.update(user.as_str().as_bytes());
        format!("{}.{}", user, hex::encode(mac.finalize().into_bytes()))
    }

    /// Resolve a session token to its user id.
    pub fn resolve(&self, token: &str) -> Result<UserId> {
        let (user, signature) = token
            .trim()
            .rsplit_once('.')
            .ok_or_else(|| Error::Unauthorized("malformed session token".to_string()))?;
        let user = UserId::parse(user)
            .map_err(|_| Error::Unauthorized("malformed session token".to_string()))?;
        let signature = hex::decode(signature)
            .map_err(|_| Error::Unauthorized("malformed session token".to_string()))?;

        let mut mac = self.mac();
        mac.update(user.as_str().as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| Error::Unauthorized("invalid session token".to_string()))?;
        Ok(user)
    }

    /// Resolve an `Authorization` header value (`Bearer <token>`).
    pub fn resolve_header(&self, header: Option<&str>) -> Result<UserId> {
        let header =
            header.ok_or_else(|| Error::Unauthorized("missing Authorization header".to_string()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Error::Unauthorized("expected a Bearer token".to_string()))?;
        self.resolve(token)
    }
}
