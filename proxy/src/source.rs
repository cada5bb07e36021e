use crate::config::{ConnectionsConfig, DEFAULT_MOD};
use crate::errors::{ProxyError, Result};
use std::sync::Arc;

/// A functional transformation applied to a file inside a torrent,
/// selected by the `~modType[:extra][/subpath]` URL suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMod {
    pub r#type: String,
    pub path: String,
    pub extra: String,
    /// Backend name of the mod's connection config.
    pub name: String,
}

/// Parsed request descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// 40-hex sha1 of the torrent, or empty when a mod name is addressed
    /// directly at the URL root.
    pub info_hash: String,
    /// Cleaned file path inside the torrent, always starting with `/`.
    pub path: String,
    /// `default` or the mod name found at the URL root.
    pub r#type: String,
    /// Backend name of the connection config serving `r#type`.
    pub name: String,
    pub token: String,
    pub api_key: String,
    /// Raw query string as received.
    pub query: String,
    pub r#mod: Option<SourceMod>,
}

impl Source {
    /// Fingerprint deduplicating backend workers for this request shape.
    pub fn key(&self) -> String {
        let mut key = format!("{}{}", self.info_hash, self.r#type);
        if let Some(m) = &self.r#mod {
            key.push_str(&m.r#type);
            key.push_str(&m.extra);
        }
        key
    }

    /// Mod name when a mod is attached, else the root type; the config key
    /// whose connection serves this request.
    pub fn edge_type(&self) -> &str {
        match &self.r#mod {
            Some(m) => &m.r#type,
            None => &self.r#type,
        }
    }

    /// Backend name used as the metrics/analytics edge label.
    pub fn edge_name(&self) -> &str {
        match &self.r#mod {
            Some(m) => &m.name,
            None => &self.name,
        }
    }

    /// Path the upstream should see: the mod subpath when a mod is
    /// attached, the file path otherwise.
    pub fn upstream_path(&self) -> &str {
        match &self.r#mod {
            Some(m) => &m.path,
            None => &self.path,
        }
    }
}

fn is_hash(s: &str) -> bool {
    (5..=40).contains(&s.len())
        && s.bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Lexically clean an absolute path: collapse `//` and `.`, resolve `..`
/// without escaping the root.
fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

pub struct UrlParser {
    mods: Arc<ConnectionsConfig>,
}

impl UrlParser {
    pub fn new(mods: Arc<ConnectionsConfig>) -> Self {
        Self { mods }
    }

    /// Extract the source descriptor from a request URI.
    pub fn parse(&self, uri: &http::Uri) -> Result<Source> {
        let url_path = uri.path();
        if url_path.is_empty() || url_path == "/" {
            return Err(ProxyError::Parse("empty url".into()));
        }

        let trimmed = url_path.strip_prefix('/').unwrap_or(url_path);
        let (head, rest) = match trimmed.split_once('/') {
            Some((h, r)) => (h, Some(r)),
            None => (trimmed, None),
        };
        if head.is_empty() {
            return Err(ProxyError::Parse("empty hash".into()));
        }

        let (source_type, info_hash) = if self.mods.mods().any(|m| m == head) {
            (head.to_string(), String::new())
        } else if is_hash(head) {
            (DEFAULT_MOD.to_string(), head.to_string())
        } else {
            return Err(ProxyError::Parse(format!("wrong hash={head}")));
        };

        let name = self
            .mods
            .get(&source_type)
            .map(|c| c.name().to_string())
            .unwrap_or_default();

        let path = format!("/{}", rest.unwrap_or_default());
        let (path, r#mod) = self.extract_mod(&path);

        let query = uri.query().unwrap_or_default().to_string();
        let mut token = String::new();
        let mut api_key = String::new();
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            match k.as_ref() {
                "token" => token = v.into_owned(),
                "api-key" => api_key = v.into_owned(),
                _ => {}
            }
        }

        Ok(Source {
            info_hash,
            path,
            r#type: source_type,
            name,
            token,
            api_key,
            query,
            r#mod,
        })
    }

    /// Split a `~modType[:extra][/subpath]` suffix off the path. An unknown
    /// mod type leaves the path untouched, tilde included.
    fn extract_mod(&self, path: &str) -> (String, Option<SourceMod>) {
        let Some(index) = path.rfind('~') else {
            return (clean_path(path), None);
        };
        let (first, last) = (&path[..index], &path[index + 1..]);

        let (selector, mod_path) = match last.split_once('/') {
            Some((t, p)) => (t, p),
            None => (last, ""),
        };
        let (mod_type, extra) = match selector.split_once(':') {
            Some((t, e)) => (t, e),
            None => (selector, ""),
        };

        if !self.mods.mods().any(|m| m == mod_type) {
            return (clean_path(path), None);
        }
        let name = self
            .mods
            .get(mod_type)
            .map(|c| c.name().to_string())
            .unwrap_or_default();

        let m = SourceMod {
            r#type: mod_type.to_string(),
            path: clean_path(&format!("/{mod_path}")),
            extra: extra.to_string(),
            name,
        };
        (clean_path(first), Some(m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ConnectionConfig, Distribution, JobConfig, ServiceConfig,
    };
    use std::collections::HashMap;

    fn test_config() -> Arc<ConnectionsConfig> {
        let mut mods = HashMap::new();
        mods.insert(
            "default".to_string(),
            ConnectionConfig::Service(ServiceConfig {
                name: "torrent-web-seeder".into(),
                distribution: Distribution::Hash,
                prefer_local_node: false,
                headers: HashMap::new(),
            }),
        );
        mods.insert(
            "hls".to_string(),
            ConnectionConfig::Job(JobConfig {
                name: "content-transcoder".into(),
                image: "example/transcoder".into(),
                cpu_requests: String::new(),
                cpu_limits: String::new(),
                memory_requests: String::new(),
                memory_limits: String::new(),
                grace: 600,
                ignored_paths: vec![],
                env: HashMap::new(),
                labels: HashMap::new(),
                snapshot: None,
                object_store: None,
            }),
        );
        mods.insert(
            "vtt".to_string(),
            ConnectionConfig::Service(ServiceConfig {
                name: "srt2vtt".into(),
                distribution: Distribution::Hash,
                prefer_local_node: false,
                headers: HashMap::new(),
            }),
        );
        Arc::new(ConnectionsConfig(mods))
    }

    fn parse(url: &str) -> Result<Source> {
        let uri: http::Uri = url.parse().expect("valid uri");
        UrlParser::new(test_config()).parse(&uri)
    }

    const HASH: &str = "935d59df63e6b94305b5e2a32cdfd00488f1b055";

    #[test]
    fn plain_file() {
        let src = parse(&format!("/{HASH}/a.mp4")).unwrap();
        assert_eq!(src.info_hash, HASH);
        assert_eq!(src.path, "/a.mp4");
        assert_eq!(src.r#type, "default");
        assert_eq!(src.name, "torrent-web-seeder");
        assert!(src.r#mod.is_none());
        assert_eq!(src.upstream_path(), "/a.mp4");
    }

    #[test]
    fn mod_with_extra_and_subpath() {
        let src = parse(&format!("/{HASH}/foo.mkv~hls:720p/index.m3u8")).unwrap();
        assert_eq!(src.info_hash, HASH);
        assert_eq!(src.path, "/foo.mkv");
        let m = src.r#mod.as_ref().expect("mod");
        assert_eq!(m.r#type, "hls");
        assert_eq!(m.extra, "720p");
        assert_eq!(m.path, "/index.m3u8");
        assert_eq!(m.name, "content-transcoder");
        assert_eq!(src.edge_type(), "hls");
        assert_eq!(src.edge_name(), "content-transcoder");
        assert_eq!(src.upstream_path(), "/index.m3u8");
    }

    #[test]
    fn mod_name_at_root() {
        let src = parse("/vtt/subs/foo.srt").unwrap();
        assert_eq!(src.info_hash, "");
        assert_eq!(src.r#type, "vtt");
        assert_eq!(src.path, "/subs/foo.srt");
        assert_eq!(src.name, "srt2vtt");
    }

    #[test]
    fn unknown_mod_type_keeps_path() {
        let src = parse(&format!("/{HASH}/weird~name.bin")).unwrap();
        assert_eq!(src.path, "/weird~name.bin");
        assert!(src.r#mod.is_none());
    }

    #[test]
    fn last_tilde_wins() {
        let src = parse(&format!("/{HASH}/a~b/file.mkv~hls/s1.ts")).unwrap();
        assert_eq!(src.path, "/a~b/file.mkv");
        assert_eq!(src.r#mod.as_ref().unwrap().r#type, "hls");
        assert_eq!(src.r#mod.as_ref().unwrap().path, "/s1.ts");
    }

    #[test]
    fn query_params_captured() {
        let src = parse(&format!("/{HASH}/a.mp4?token=t1&api-key=k1&invoke=false")).unwrap();
        assert_eq!(src.token, "t1");
        assert_eq!(src.api_key, "k1");
        assert_eq!(src.query, "token=t1&api-key=k1&invoke=false");
    }

    #[test]
    fn short_hex_head_is_accepted() {
        let src = parse("/935d5/a.mp4").unwrap();
        assert_eq!(src.info_hash, "935d5");
    }

    #[test]
    fn invalid_hash_rejected() {
        assert!(matches!(parse("/nothex!/a.mp4"), Err(ProxyError::Parse(_))));
        assert!(matches!(parse("/abcd/a.mp4"), Err(ProxyError::Parse(_))));
        assert!(matches!(parse("/"), Err(ProxyError::Parse(_))));
    }

    #[test]
    fn dotdot_cannot_escape_root() {
        let src = parse(&format!("/{HASH}/../../etc/passwd")).unwrap();
        assert_eq!(src.path, "/etc/passwd");
        let src = parse(&format!("/{HASH}/a/../b.mkv~hls/../../x")).unwrap();
        assert_eq!(src.path, "/b.mkv");
        assert_eq!(src.r#mod.as_ref().unwrap().path, "/x");
    }

    #[test]
    fn key_includes_mod_type_and_extra() {
        let plain = parse(&format!("/{HASH}/a.mp4")).unwrap();
        assert_eq!(plain.key(), format!("{HASH}default"));
        let modded = parse(&format!("/{HASH}/a.mkv~hls:720p/x.ts")).unwrap();
        assert_eq!(modded.key(), format!("{HASH}defaulthls720p"));
    }
}
