use std::collections::HashSet;

use auth::{CallerIdentity, JwtValidationConfig, TokenError, verify_hs256_token};

use super::{HttpRequest, ServiceConfig, config::unix_now_secs};

const COMPANY_HEADER: &str = "x-company-code";
const USER_ID_HEADER: &str = "x-user-id";
const USER_NAME_HEADER: &str = "x-user-name";
const ANONYMOUS_USER: &str = "System";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AuthDecision {
    Allowed(CallerIdentity),
    Unauthorized(&'static str),
    Forbidden(&'static str),
}

/// Companies the service will serve. Entries are compared lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanyScope {
    Any,
    Set(HashSet<String>),
}

impl CompanyScope {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Any;
        };
        let mut companies = HashSet::new();
        for value in raw.split(',') {
            let company = value.trim();
            if company.is_empty() {
                continue;
            }
            if company == "*" {
                return Self::Any;
            }
            companies.insert(company.to_ascii_lowercase());
        }
        if companies.is_empty() {
            Self::Any
        } else {
            Self::Set(companies)
        }
    }

    pub fn allows(&self, company: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Set(companies) => companies.contains(&company.to_ascii_lowercase()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AuthPolicy {
    jwt: Option<JwtValidationConfig>,
    trusted_headers: bool,
    allowed_companies: CompanyScope,
}

impl AuthPolicy {
    pub(crate) fn from_config(config: &ServiceConfig) -> Self {
        Self {
            jwt: config.jwt.clone(),
            trusted_headers: config.trusted_headers,
            allowed_companies: config.allowed_companies.clone(),
        }
    }
}

/// Resolves the caller and company. A presented JWT wins over headers.
pub(crate) fn authenticate(request: &HttpRequest, policy: &AuthPolicy) -> AuthDecision {
    if let Some(jwt_config) = policy.jwt.as_ref()
        && let Some(token) = presented_bearer_token(request)
        && bearer_looks_like_jwt(token)
    {
        return match verify_hs256_token(token, jwt_config, unix_now_secs()) {
            Ok(identity) => admit(identity, policy),
            Err(TokenError::Expired) => AuthDecision::Unauthorized("JWT expired"),
            Err(TokenError::MissingClaim("companyCode")) => {
                AuthDecision::Unauthorized("company code is required")
            }
            Err(_) => AuthDecision::Unauthorized("invalid JWT"),
        };
    }

    if !policy.trusted_headers {
        return AuthDecision::Unauthorized("missing or invalid bearer token");
    }
    let Some(company_code) = header(request, COMPANY_HEADER) else {
        return AuthDecision::Unauthorized("company code is required");
    };
    let identity = CallerIdentity {
        company_code: company_code.to_string(),
        user_id: header(request, USER_ID_HEADER)
            .unwrap_or(ANONYMOUS_USER)
            .to_string(),
        user_name: header(request, USER_NAME_HEADER).map(str::to_string),
    };
    admit(identity, policy)
}

fn admit(identity: CallerIdentity, policy: &AuthPolicy) -> AuthDecision {
    if identity.company_code.trim().is_empty() {
        return AuthDecision::Unauthorized("company code is required");
    }
    if !policy.allowed_companies.allows(identity.company_code.trim()) {
        return AuthDecision::Forbidden("company is not allowed by service policy");
    }
    AuthDecision::Allowed(identity)
}

fn header<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .get(name)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn presented_bearer_token(request: &HttpRequest) -> Option<&str> {
    let value = request.headers.get("authorization")?;
    value.strip_prefix("Bearer ").map(str::trim)
}

fn bearer_looks_like_jwt(token: &str) -> bool {
    let mut parts = token.split('.');
    let first = parts.next().unwrap_or_default();
    let second = parts.next().unwrap_or_default();
    let third = parts.next().unwrap_or_default();
    parts.next().is_none() && !first.is_empty() && !second.is_empty() && !third.is_empty()
}
