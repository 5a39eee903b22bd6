//! Static frontend assets and UI language negotiation.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use log::{debug, info, warn};

use crate::config::AppConfig;

const PLACEHOLDER_ORIGIN: &str = "[[[.Origin]]]";
const PLACEHOLDER_CDN: &str = "[[[.CdnPrefix]]]";

#[derive(Debug, Clone)]
pub struct Asset {
    pub bytes: Vec<u8>,
    pub mime: mime::Mime,
}

fn mime_for(path: &str) -> mime::Mime {
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()).unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => mime::TEXT_HTML_UTF_8,
        "js" | "mjs" => mime::APPLICATION_JAVASCRIPT_UTF_8,
        "css" => mime::TEXT_CSS_UTF_8,
        "json" => mime::APPLICATION_JSON,
        "svg" => mime::IMAGE_SVG,
        "png" => mime::IMAGE_PNG,
        "jpg" | "jpeg" => mime::IMAGE_JPEG,
        "gif" => mime::IMAGE_GIF,
        "txt" => mime::TEXT_PLAIN_UTF_8,
        "woff" => mime::FONT_WOFF,
        "woff2" => mime::FONT_WOFF2,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

fn is_text(m: &mime::Mime) -> bool {
    m.type_() == mime::TEXT || m.subtype() == mime::JAVASCRIPT || m.subtype() == mime::JSON || m.subtype() == mime::SVG
}

/// Files under the static root, loaded once with placeholders substituted.
#[derive(Debug, Default)]
pub struct StaticAssets {
    files: HashMap<String, Asset>,
}

impl StaticAssets {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(root: &Path, cfg: &AppConfig) -> std::io::Result<Self> {
        let mut files = HashMap::new();
        let mut dirs = vec![root.to_path_buf()];
        while let Some(dir) = dirs.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    dirs.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(root) else { continue };
                let key = format!("/{}", rel.to_string_lossy().replace('\\', "/"));
                let raw = std::fs::read(&path)?;
                files.insert(key.clone(), Self::prepare(&key, raw, cfg));
            }
        }
        info!("loaded {} static files from {}", files.len(), root.display());
        Ok(Self { files })
    }

    fn prepare(key: &str, raw: Vec<u8>, cfg: &AppConfig) -> Asset {
        let mime = mime_for(key);
        let bytes = if is_text(&mime) {
            match String::from_utf8(raw) {
                Ok(s) => s.replace(PLACEHOLDER_ORIGIN, &cfg.base_url).replace(PLACEHOLDER_CDN, &cfg.cdn_url).into_bytes(),
                Err(e) => {
                    warn!("static file {key} is not UTF-8; served verbatim");
                    e.into_bytes()
                }
            }
        } else {
            raw
        };
        Asset { bytes, mime }
    }

    /// Registers an in-memory file, substituting placeholders like `load` does.
    pub fn insert(&mut self, path: &str, raw: Vec<u8>, cfg: &AppConfig) {
        self.files.insert(path.to_string(), Self::prepare(path, raw, cfg));
    }

    /// Exact file lookup; directories are never listed.
    pub fn get(&self, path: &str) -> Option<&Asset> {
        if path.ends_with('/') {
            return None;
        }
        self.files.get(path)
    }

    /// The file at `path`, or the language's `index.html` for unknown paths
    /// below a supported language root.
    pub fn resolve(&self, path: &str, languages: &[String]) -> Option<&Asset> {
        if let Some(a) = self.get(path) {
            return Some(a);
        }
        let lang = path.trim_start_matches('/').split('/').next()?;
        if languages.iter().any(|l| l == lang) && path.len() > lang.len() + 1 {
            debug!("serving {lang} index for {path}");
            return self.files.get(&format!("/{lang}/index.html"));
        }
        None
    }
}

/// Picks the best supported language for an `Accept-Language` header value.
pub fn best_language(accept: Option<&str>, supported: &[String], default: &str) -> String {
    let mut prefs: Vec<(f32, String)> = accept
        .unwrap_or_default()
        .split(',')
        .filter_map(|part| {
            let mut it = part.trim().split(';');
            let tag = it.next()?.trim().to_ascii_lowercase();
            if tag.is_empty() {
                return None;
            }
            let q = it.find_map(|p| p.trim().strip_prefix("q=").and_then(|v| v.parse::<f32>().ok())).unwrap_or(1.0);
            Some((q, tag))
        })
        .collect();
    prefs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    for (_, tag) in prefs {
        let primary = tag.split('-').next().unwrap_or_default();
        if let Some(l) = supported.iter().find(|l| l.eq_ignore_ascii_case(&tag) || l.eq_ignore_ascii_case(primary)) {
            return l.clone();
        }
    }
    default.to_string()
}

/// Widget strings for languages without a catalog file under the static root.
pub fn builtin_messages(lang: &str) -> Option<BTreeMap<&'static str, &'static str>> {
    let pairs: &[(&str, &str)] = match lang {
        "en" => &[
            ("actionAddComment", "Add comment"),
            ("actionApprove", "Approve"),
            ("actionDelete", "Delete"),
            ("actionEdit", "Edit"),
            ("actionLogin", "Login"),
            ("actionLogout", "Logout"),
            ("actionReject", "Reject"),
            ("actionReply", "Reply"),
            ("actionSignUp", "Sign up"),
            ("commentDeleted", "(deleted)"),
            ("commentPending", "Awaiting moderation"),
            ("errorDomainReadonly", "This domain is read-only"),
            ("errorPageReadonly", "This page is read-only"),
            ("noComments", "No comments yet"),
            ("sortNewest", "Newest"),
            ("sortOldest", "Oldest"),
            ("sortVotes", "Most upvoted"),
        ],
        "de" => &[
            ("actionAddComment", "Kommentar hinzufügen"),
            ("actionApprove", "Freigeben"),
            ("actionDelete", "Löschen"),
            ("actionEdit", "Bearbeiten"),
            ("actionLogin", "Anmelden"),
            ("actionLogout", "Abmelden"),
            ("actionReject", "Ablehnen"),
            ("actionReply", "Antworten"),
            ("actionSignUp", "Registrieren"),
            ("commentDeleted", "(gelöscht)"),
            ("commentPending", "Wartet auf Moderation"),
            ("errorDomainReadonly", "Diese Domain ist schreibgeschützt"),
            ("errorPageReadonly", "Diese Seite ist schreibgeschützt"),
            ("noComments", "Noch keine Kommentare"),
            ("sortNewest", "Neueste"),
            ("sortOldest", "Älteste"),
            ("sortVotes", "Beste Bewertung"),
        ],
        _ => return None,
    };
    Some(pairs.iter().copied().collect())
}
