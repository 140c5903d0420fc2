use std::path::Path;

use anyhow::Context;

use super::AuthCookies;

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

/// Extracts the cookies for `domain` from a Netscape `cookies.txt` export.
///
/// Lines are `domain, include_subdomains, path, secure, expiry, name, value`
/// separated by tabs. Comment and blank lines are skipped, except for the
/// `#HttpOnly_` marker that browsers prepend to http-only cookie domains.
/// Malformed lines are ignored.
pub fn parse_netscape_cookies(text: &str, domain: &str) -> AuthCookies {
    let wanted = domain.trim().trim_start_matches('.');
    AuthCookies::new(text.lines().filter_map(|line| {
        let line = line.trim_end_matches(['\r', '\n']);
        let line = match line.strip_prefix(HTTP_ONLY_PREFIX) {
            Some(rest) => rest,
            None if line.trim_start().starts_with('#') || line.trim().is_empty() => return None,
            None => line,
        };
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            return None;
        }
        let cookie_domain = fields[0].trim().trim_start_matches('.');
        if !cookie_domain.eq_ignore_ascii_case(wanted) {
            return None;
        }
        Some((fields[5].trim().to_string(), fields[6].trim().to_string()))
    }))
}

pub fn load_netscape_cookies(path: &Path, domain: &str) -> anyhow::Result<AuthCookies> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading cookie file {}", path.display()))?;
    Ok(parse_netscape_cookies(&text, domain))
}
