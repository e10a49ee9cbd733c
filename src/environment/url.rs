//! Clone-URL parsing and address translation helpers.

use url::{Host, Url};

use crate::environment::EnvError;

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "ssh", "git"];

/// Parses a clone URL, accepting SCP-style specs (`user@host:path`,
/// `host:/path`) by rewriting them to `ssh://` URIs first.
pub fn parse_clone_url(raw: &str) -> Result<Url, EnvError> {
    let raw = raw.trim();
    let normalized = scp_to_uri(raw).unwrap_or_else(|| raw.to_string());
    let url = Url::parse(&normalized).map_err(|e| EnvError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(EnvError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(EnvError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    if url.password().is_some() {
        return Err(EnvError::InsecureUrl(url.host_str().unwrap_or_default().to_string()));
    }
    Ok(url)
}

fn scp_to_uri(raw: &str) -> Option<String> {
    if raw.contains("://") {
        return None;
    }
    let (user_host, path) = raw.split_once(':')?;
    if user_host.is_empty() || user_host.contains('/') {
        return None;
    }
    let path = path.strip_prefix('/').unwrap_or(path);
    Some(format!("ssh://{user_host}/{path}"))
}

pub fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => {
            domain.eq_ignore_ascii_case("localhost") || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Rewrites a loopback URL so it is reachable from inside a container.
/// Other URLs are returned unchanged.
pub fn container_url(url: &Url, container_host: &str) -> Result<Url, EnvError> {
    if !is_loopback(url) {
        return Ok(url.clone());
    }
    let mut rewritten = url.clone();
    rewritten
        .set_host(Some(container_host))
        .map_err(|e| EnvError::InvalidUrl {
            url: container_host.to_string(),
            reason: e.to_string(),
        })?;
    Ok(rewritten)
}

/// Appends `path` below `base`, keeping any path prefix `base` already has.
pub fn join_path(base: &Url, path: &str) -> Result<Url, EnvError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let prefix = format!("{}/", base.path());
        base.set_path(&prefix);
    }
    base.join(path.trim_start_matches('/'))
        .map_err(|e| EnvError::InvalidUrl {
            url: format!("{base}{path}"),
            reason: e.to_string(),
        })
}

/// Workspace link for a clone URL: host+path for ordinary hosts, path only
/// for loopback, IP-literal or explicit-port hosts.
pub fn repo_link(url: &Url) -> String {
    let path = url.path().trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);

    let synthetic = is_loopback(url)
        || matches!(url.host(), Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)))
        || url.port().is_some();
    match url.host_str() {
        Some(host) if !synthetic => format!("{host}/{path}"),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        parse_clone_url(s).unwrap()
    }

    #[test]
    fn scp_style_specs_become_ssh_urls() {
        assert_eq!(
            url("git@github.com:foo/bar.git").as_str(),
            "ssh://git@github.com/foo/bar.git"
        );
        assert_eq!(
            url("example.com:/srv/repo").as_str(),
            "ssh://example.com/srv/repo"
        );
        assert_eq!(url("https://example.com/x").as_str(), "https://example.com/x");
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(matches!(
            parse_clone_url("not a url"),
            Err(EnvError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_clone_url("file:///tmp/repo"),
            Err(EnvError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_clone_url("https://user:pw@example.com/repo"),
            Err(EnvError::InsecureUrl(_))
        ));
    }

    #[test]
    fn loopback_urls_are_rewritten_for_containers() {
        let rewritten = container_url(&url("http://localhost:3080/x"), "172.17.0.1").unwrap();
        assert_eq!(rewritten.as_str(), "http://172.17.0.1:3080/x");

        let rewritten =
            container_url(&url("http://127.0.0.1/x?y=1"), "host.docker.internal").unwrap();
        assert_eq!(rewritten.as_str(), "http://host.docker.internal/x?y=1");

        let untouched = container_url(&url("http://example.com/x"), "172.17.0.1").unwrap();
        assert_eq!(untouched.as_str(), "http://example.com/x");
    }

    #[test]
    fn join_keeps_prefix() {
        let base = Url::parse("https://example.com/prefix").unwrap();
        assert_eq!(
            join_path(&base, "/a/b").unwrap().as_str(),
            "https://example.com/prefix/a/b"
        );
        let base = Url::parse("http://localhost:3080").unwrap();
        assert_eq!(join_path(&base, "a").unwrap().as_str(), "http://localhost:3080/a");
    }

    #[test]
    fn repo_links() {
        assert_eq!(repo_link(&url("http://example.com/my/repo.git")), "example.com/my/repo");
        assert_eq!(repo_link(&url("http://localhost/my/repo")), "my/repo");
        assert_eq!(repo_link(&url("http://1.2.3.4:1234/my/repo")), "my/repo");
        assert_eq!(repo_link(&url("http://example.com:8080/my/repo")), "my/repo");
        assert_eq!(
            repo_link(&url("git@github.com:foo/bar.git")),
            "github.com/foo/bar"
        );
    }
}
