//! Scoped bearer-token authentication.
//!
//! Three scopes (read < write < admin); tokens are compared in constant time
//! via SHA-256 digest equality. With no token configured for a scope the
//! adapter fails closed.

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};

use crate::api::problem::Problem;
use crate::api::request_id::RequestId;
use crate::config::ApiTokens;

/// Access scopes, strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    Read,
    Write,
    Admin,
}

type Digest32 = [u8; 32];

fn digest(token: &str) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

fn constant_time_eq(a: &Digest32, b: &Digest32) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Token digests per scope.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    read: Option<Digest32>,
    write: Option<Digest32>,
    admin: Option<Digest32>,
}

impl AuthConfig {
    pub fn new(tokens: &ApiTokens) -> Self {
        Self {
            read: tokens.read.as_deref().map(digest),
            write: tokens.write.as_deref().map(digest),
            admin: tokens.admin.as_deref().map(digest),
        }
    }

    /// Digests acceptable for a required scope: a higher scope's token always
    /// satisfies a lower one.
    fn accepted(&self, required: Scope) -> impl Iterator<Item = &Digest32> {
        let (read, write) = match required {
            Scope::Read => (self.read.as_ref(), self.write.as_ref()),
            Scope::Write => (None, self.write.as_ref()),
            Scope::Admin => (None, None),
        };
        read.into_iter()
            .chain(write)
            .chain(self.admin.as_ref())
    }

    /// Authorize a bearer token for a scope. Fails closed: no configured
    /// token for the scope chain means no access.
    pub fn authorize(&self, bearer: Option<&str>, required: Scope) -> bool {
        let Some(token) = bearer else {
            return false;
        };
        let presented = digest(token);
        // Fold over every candidate so timing does not reveal which digest
        // (if any) matched.
        let mut ok = false;
        for candidate in self.accepted(required) {
            ok |= constant_time_eq(candidate, &presented);
        }
        ok
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
}

fn reject(request: &Request) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();
    Problem::new(
        StatusCode::UNAUTHORIZED,
        "auth/unauthorized",
        "Unauthorized",
        "missing or invalid bearer token",
        request_id,
    )
    .into_response()
}

macro_rules! scope_middleware {
    ($name:ident, $scope:expr) => {
        pub async fn $name(
            State(auth): State<AuthConfig>,
            request: Request,
            next: Next,
        ) -> Response {
            if auth.authorize(bearer_token(&request), $scope) {
                next.run(request).await
            } else {
                reject(&request)
            }
        }
    };
}

scope_middleware!(require_read, Scope::Read);
scope_middleware!(require_write, Scope::Write);
scope_middleware!(require_admin, Scope::Admin);

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(read: Option<&str>, write: Option<&str>, admin: Option<&str>) -> AuthConfig {
        AuthConfig::new(&ApiTokens {
            read: read.map(String::from),
            write: write.map(String::from),
            admin: admin.map(String::from),
        })
    }

    #[test]
    fn scope_hierarchy() {
        let auth = tokens(Some("r"), Some("w"), Some("a"));
        assert!(auth.authorize(Some("r"), Scope::Read));
        assert!(!auth.authorize(Some("r"), Scope::Write));
        assert!(!auth.authorize(Some("r"), Scope::Admin));

        assert!(auth.authorize(Some("w"), Scope::Read));
        assert!(auth.authorize(Some("w"), Scope::Write));
        assert!(!auth.authorize(Some("w"), Scope::Admin));

        assert!(auth.authorize(Some("a"), Scope::Read));
        assert!(auth.authorize(Some("a"), Scope::Write));
        assert!(auth.authorize(Some("a"), Scope::Admin));
    }

    #[test]
    fn fails_closed_without_configuration() {
        let auth = tokens(None, None, None);
        assert!(!auth.authorize(Some("anything"), Scope::Read));
        assert!(!auth.authorize(None, Scope::Read));
    }

    #[test]
    fn rejects_wrong_tokens() {
        let auth = tokens(Some("secret"), None, None);
        assert!(!auth.authorize(Some("wrong"), Scope::Read));
        assert!(!auth.authorize(Some(""), Scope::Read));
        assert!(auth.authorize(Some("secret"), Scope::Read));
    }

    #[test]
    fn digest_comparison_is_exact() {
        let a = digest("alpha");
        let b = digest("alpha");
        let c = digest("beta");
        assert!(constant_time_eq(&a, &b));
        assert!(!constant_time_eq(&a, &c));
    }
}
