//! Request path normalization, permission-code inference and route templates

use crate::error::{AuthzError, Result};
use regex::Regex;
use uuid::Uuid;

/// Default API prefix pattern: `/api` optionally followed by a version
pub const DEFAULT_API_PREFIX: &str = r"/api(/v\d+)?";

/// Normalizes request paths and infers permission codes from them
#[derive(Debug, Clone)]
pub struct PathInference {
    prefix: Regex,
}

impl PathInference {
    /// `api_prefix` is a regex matched at the start of the path
    pub fn new(api_prefix: &str) -> Result<Self> {
        let prefix = Regex::new(&format!("^(?:{})", api_prefix))
            .map_err(|e| AuthzError::InvalidInput(format!("invalid api prefix pattern: {}", e)))?;
        Ok(Self { prefix })
    }

    /// Strip the API prefix and any trailing slash. A prefix match only counts
    /// on a segment boundary.
    pub fn normalize<'a>(&self, path: &'a str) -> &'a str {
        let stripped = match self.prefix.find(path) {
            Some(m) if path[m.end()..].is_empty() || path[m.end()..].starts_with('/') => &path[m.end()..],
            _ => path,
        };
        stripped.trim_end_matches('/')
    }

    /// Infer the permission code addressed by a request, e.g.
    /// `GET /api/v1/users/42` becomes `users_detail_api`.
    pub fn infer_code(&self, path: &str, method: &str) -> String {
        let mut has_param = false;
        let mut segments = Vec::new();

        for segment in self.normalize(path).split('/').filter(|s| !s.is_empty()) {
            if is_param_segment(segment) {
                has_param = true;
            } else {
                segments.push(segment);
            }
        }

        let action = match method.to_ascii_uppercase().as_str() {
            "GET" if has_param => "detail",
            "GET" => "list",
            "POST" => "create",
            "PUT" | "PATCH" => "update",
            "DELETE" => "delete",
            _ => "access",
        };

        segments.push(action);
        format!("{}_api", segments.join("_"))
    }
}

impl Default for PathInference {
    fn default() -> Self {
        Self {
            prefix: Regex::new(&format!("^(?:{})", DEFAULT_API_PREFIX)).expect("default prefix is valid"),
        }
    }
}

fn is_placeholder(segment: &str) -> bool {
    segment.starts_with(':') || segment == "*" || (segment.starts_with('{') && segment.ends_with('}'))
}

/// Placeholder or a concrete identifier value
fn is_param_segment(segment: &str) -> bool {
    is_placeholder(segment)
        || segment.bytes().all(|b| b.is_ascii_digit())
        || Uuid::parse_str(segment).is_ok()
}

/// Whether a stored route template such as `/api/v1/roles/:id/permissions`
/// matches a concrete request path. Placeholders (`:id`, `{id}`, `*`) match
/// exactly one non-empty segment.
pub fn template_matches(template: &str, path: &str) -> bool {
    let template = template.trim_end_matches('/');
    let path = path.trim_end_matches('/');

    let mut expected = template.split('/');
    let mut actual = path.split('/');
    loop {
        match (expected.next(), actual.next()) {
            (None, None) => return true,
            (Some(t), Some(p)) => {
                let ok = if is_placeholder(t) { !p.is_empty() } else { t == p };
                if !ok {
                    return false;
                }
            }
            _ => return false,
        }
    }
}
