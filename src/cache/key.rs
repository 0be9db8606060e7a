/// Cache keys are the inbound host plus the request path, so the same image
/// pulled through two virtual hosts caches independently.
pub fn cache_key(host: &str, path: &str) -> String {
    format!("{host}{path}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Manifest,
    Blob,
}

/// Splits a registry path (optionally prefixed with a host) into its kind,
/// repository and reference: `host/v2/<repo>/manifests/<reference>` or
/// `host/v2/<repo>/blobs/<digest>`.
pub fn parse_path(path: &str) -> Option<(PathKind, String, String)> {
    let idx = path.find("/v2/")?;
    let rest = &path[idx + "/v2/".len()..];

    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() < 3 {
        return None;
    }

    for (i, part) in parts.iter().enumerate() {
        let kind = match *part {
            "manifests" => PathKind::Manifest,
            "blobs" => PathKind::Blob,
            _ => continue,
        };
        if i + 1 < parts.len() {
            let repo = parts[..i].join("/");
            let reference = parts[i + 1..].join("/");
            return Some((kind, repo, reference));
        }
    }

    None
}

/// Manifest requests and digest-addressed blob requests are cacheable;
/// everything else (tag lists, uploads, referrers) streams through.
pub fn is_cacheable(path: &str) -> bool {
    path.contains("/manifests/") || path.contains("/blobs/sha256:")
}

/// Extracts the `sha256:<64-hex>` digest embedded in a path, if any.
pub fn digest_from_path(path: &str) -> Option<&str> {
    let idx = path.find("sha256:")?;
    let end = idx + "sha256:".len() + 64;
    if end <= path.len() {
        Some(&path[idx..end])
    } else {
        None
    }
}
