/*!
Entity codec: converts stored posts to snapshot records and back.

Encoding is a plain projection. Decoding treats the snapshot as untrusted and
re-sanitizes every field on its way back into the store.
*/

use chrono::{NaiveDateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

use crate::model::{EntityKind, EntityPost, EntityRecord, TransactionRecord};
use crate::store::{NewPost, PostRow, StoredPost};
use crate::value::{Meta, MetaValue};

const POST_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Post statuses accepted on restore.
pub const ALLOWED_POST_STATUSES: [&str; 5] = ["publish", "draft", "pending", "private", "future"];

pub const DEFAULT_POST_STATUS: &str = "publish";

/// Transaction statuses accepted on restore.
pub const ALLOWED_TRANSACTION_STATUSES: [&str; 3] = ["em_aberto", "pago", "cancelado"];

pub const DEFAULT_TRANSACTION_STATUS: &str = "em_aberto";

/// Sanitized insert request produced by [`decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreationRequest {
    pub post: NewPost,
    pub meta: Vec<(String, MetaValue)>,
}

/// Project a stored post onto its snapshot record.
///
/// When a key was stored more than once the first value wins.
pub fn encode(stored: &StoredPost) -> EntityRecord {
    let mut meta = Meta::new();
    for (key, raw) in &stored.meta {
        meta.entry(key.clone())
            .or_insert_with(|| MetaValue::from_stored(raw));
    }

    EntityRecord {
        id: stored.post.id,
        post: encode_post(&stored.post),
        meta,
    }
}

pub(crate) fn encode_post(post: &PostRow) -> EntityPost {
    EntityPost {
        title: post.title.clone(),
        content: post.content.clone(),
        excerpt: post.excerpt.clone(),
        status: post.status.clone(),
        date: post.date.clone(),
        modified: post.modified.clone(),
    }
}

/// Build a sanitized creation request for `kind` from a snapshot record.
///
/// Returns `None` for kinds that are not stored as posts.
pub fn decode(record: &EntityRecord, kind: EntityKind) -> Option<CreationRequest> {
    let post_type = kind.post_type()?;
    Some(CreationRequest {
        post: decode_post(&record.post, post_type, 0, ""),
        meta: sanitize_meta(&record.meta),
    })
}

pub(crate) fn decode_post(post: &EntityPost, post_type: &str, parent: i64, mime_type: &str) -> NewPost {
    let date = sanitize_datetime(&post.date);
    let modified = if post.modified.trim().is_empty() {
        date.clone()
    } else {
        sanitize_datetime(&post.modified)
    };

    NewPost {
        post_type: post_type.to_string(),
        title: strip_tags(&post.title),
        content: strip_dangerous_markup(&post.content),
        excerpt: strip_tags(&post.excerpt),
        status: allow_listed(&post.status, &ALLOWED_POST_STATUSES, DEFAULT_POST_STATUS),
        date,
        modified,
        parent,
        mime_type: strip_tags(mime_type),
    }
}

/// Re-sanitize a transaction row before insertion.
pub fn sanitize_transaction(record: &TransactionRecord) -> TransactionRecord {
    TransactionRecord {
        id: None,
        cliente_id: record.cliente_id,
        agendamento_id: record.agendamento_id,
        plano_id: record.plano_id,
        data: record
            .data
            .as_deref()
            .map(strip_tags)
            .filter(|d| !d.is_empty()),
        valor: if record.valor.is_finite() { record.valor } else { 0.0 },
        categoria: strip_tags(&record.categoria),
        tipo: sanitize_key(&record.tipo),
        status: allow_listed(
            &record.status,
            &ALLOWED_TRANSACTION_STATUSES,
            DEFAULT_TRANSACTION_STATUS,
        ),
        descricao: strip_tags(&record.descricao),
    }
}

/// Slug-sanitize metadata keys, dropping the ones that end up empty.
pub fn sanitize_meta(meta: &Meta) -> Vec<(String, MetaValue)> {
    meta.iter()
        .filter_map(|(key, value)| {
            let key = sanitize_key(key);
            (!key.is_empty()).then(|| (key, value.clone()))
        })
        .collect()
}

/// Lowercase and keep only `[a-z0-9_-]`.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Remove every tag, plus the bodies of script and style elements.
pub fn strip_tags(text: &str) -> String {
    let without_blocks = dangerous_block_regex().replace_all(text, "");
    tag_regex().replace_all(&without_blocks, "").trim().to_string()
}

/// Remove script/style elements and inline event handlers, keep other markup.
fn strip_dangerous_markup(text: &str) -> String {
    let without_blocks = dangerous_block_regex().replace_all(text, "");
    event_handler_regex()
        .replace_all(&without_blocks, "")
        .to_string()
}

fn allow_listed(value: &str, allowed: &[&str], fallback: &str) -> String {
    let value = value.trim().to_ascii_lowercase();
    if allowed.contains(&value.as_str()) {
        value
    } else {
        fallback.to_string()
    }
}

fn sanitize_datetime(value: &str) -> String {
    match NaiveDateTime::parse_from_str(value.trim(), POST_DATE_FORMAT) {
        Ok(parsed) => parsed.format(POST_DATE_FORMAT).to_string(),
        Err(_) => Utc::now().naive_utc().format(POST_DATE_FORMAT).to_string(),
    }
}

fn dangerous_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>")
            .expect("static regex")
    })
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"))
}

fn event_handler_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).expect("static regex")
    })
}
