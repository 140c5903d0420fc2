mod netscape;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use netscape::{load_netscape_cookies, parse_netscape_cookies};

/// Domain the browser export is filtered to.
pub const SERVICE_COOKIE_DOMAIN: &str = "labs.google";

/// Cookie names that may carry the signed-in session, in lookup order.
pub const SESSION_TOKEN_KEYS: [&str; 3] = [
    "__Secure-next-auth.session-token",
    "session-token",
    "auth-token",
];

/// Cookie names that may carry the CSRF security token, in lookup order.
pub const CSRF_TOKEN_KEYS: [&str; 2] = ["__Host-next-auth.csrf-token", "csrf-token"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CookieError {
    #[error("session token cookie missing (looked for {})", SESSION_TOKEN_KEYS.join(", "))]
    MissingSessionToken,
}

/// Browser-exported authentication cookies.
///
/// The store is immutable once built: refreshed cookies coming back from the
/// service are merged into a new store with [`AuthCookies::with_overrides`].
/// Iteration and the rendered `Cookie` header follow name order.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthCookies {
    cookies: BTreeMap<String, String>,
}

impl AuthCookies {
    pub fn new<I, K, V>(cookies: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let cookies = cookies
            .into_iter()
            .map(|(name, value)| (name.into().trim().to_string(), value.into()))
            .filter(|(name, _)| !name.is_empty())
            .collect();
        Self { cookies }
    }

    /// Parses a raw `Cookie` header value (`a=b; c=d`).
    ///
    /// A value without any `=` is taken to be a bare session token.
    pub fn from_cookie_header(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::default();
        }
        if !raw.contains('=') {
            return Self::new([(SESSION_TOKEN_KEYS[0], raw)]);
        }
        Self::new(raw.split(';').filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            Some((name.trim(), value.trim()))
        }))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cookies.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn session_token(&self) -> Option<&str> {
        self.first_present(&SESSION_TOKEN_KEYS)
    }

    pub fn csrf_token(&self) -> Option<&str> {
        self.first_present(&CSRF_TOKEN_KEYS)
    }

    /// The session token is the only cookie checked before going online.
    /// Whether the rest of the jar is enough is up to the session endpoint.
    pub fn require_auth(&self) -> Result<(), CookieError> {
        match self.session_token() {
            Some(_) => Ok(()),
            None => Err(CookieError::MissingSessionToken),
        }
    }

    pub fn cookie_header(&self) -> String {
        self.iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<String>>()
            .join("; ")
    }

    pub fn with_overrides(&self, refreshed: &BTreeMap<String, String>) -> Self {
        let mut cookies = self.cookies.clone();
        for (name, value) in refreshed {
            cookies.insert(name.clone(), value.clone());
        }
        Self { cookies }
    }

    fn first_present(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|key| self.get(key))
            .find(|value| !value.trim().is_empty())
    }
}

// Values are credentials; keep them out of debug output.
impl std::fmt::Debug for AuthCookies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCookies")
            .field("names", &self.cookies.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{AuthCookies, CookieError};

    fn signed_in() -> AuthCookies {
        AuthCookies::new([
            ("__Secure-next-auth.session-token", "sess"),
            ("__Host-next-auth.csrf-token", "csrf"),
            ("_ga", "GA1.1"),
        ])
    }

    #[test]
    fn header_is_rendered_in_name_order() {
        assert_eq!(
            signed_in().cookie_header(),
            "__Host-next-auth.csrf-token=csrf; __Secure-next-auth.session-token=sess; _ga=GA1.1"
        );
    }

    #[test]
    fn require_auth_needs_only_the_session_token() {
        assert_eq!(signed_in().require_auth(), Ok(()));

        let no_session = AuthCookies::new([("csrf-token", "x")]);
        assert_eq!(
            no_session.require_auth(),
            Err(CookieError::MissingSessionToken)
        );

        let session_only = AuthCookies::new([("session-token", "x")]);
        assert_eq!(session_only.csrf_token(), None);
        assert_eq!(session_only.require_auth(), Ok(()));

        let bare = AuthCookies::from_cookie_header(&"t".repeat(120));
        assert_eq!(bare.require_auth(), Ok(()));
    }

    #[test]
    fn blank_token_values_do_not_count() {
        let cookies = AuthCookies::new([
            ("__Secure-next-auth.session-token", " "),
            ("auth-token", "b"),
        ]);
        assert_eq!(cookies.session_token(), Some("b"));
    }

    #[test]
    fn cookie_header_parsing_handles_bare_tokens() {
        let bare = AuthCookies::from_cookie_header("eyJhbGciOiJkaXIi");
        assert_eq!(bare.session_token(), Some("eyJhbGciOiJkaXIi"));

        let pairs = AuthCookies::from_cookie_header(" a=1; b = 2 ;; c");
        assert_eq!(pairs.get("a"), Some("1"));
        assert_eq!(pairs.get("b"), Some("2"));
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn overrides_produce_a_new_store() {
        let original = signed_in();
        let mut refreshed = BTreeMap::new();
        refreshed.insert(
            "__Secure-next-auth.session-token".to_string(),
            "rotated".to_string(),
        );
        let updated = original.with_overrides(&refreshed);

        assert_eq!(updated.session_token(), Some("rotated"));
        assert_eq!(original.session_token(), Some("sess"));
        assert_eq!(updated.len(), original.len());
    }

    #[test]
    fn debug_output_hides_values() {
        let rendered = format!("{:?}", signed_in());
        assert!(rendered.contains("__Host-next-auth.csrf-token"));
        assert!(!rendered.contains("sess\""));
        assert!(!rendered.contains("GA1.1"));
    }

    #[test]
    fn serializes_as_a_flat_mapping() -> anyhow::Result<()> {
        let value = serde_json::to_value(signed_in())?;
        assert_eq!(value["_ga"], serde_json::json!("GA1.1"));
        let restored: AuthCookies = serde_json::from_value(value)?;
        assert_eq!(restored, signed_in());
        Ok(())
    }
}
