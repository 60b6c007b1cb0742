use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtValidationConfig {
    pub hs256_secret: String,
    pub hs256_fallback_secrets: Vec<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub leeway_secs: u64,
    pub require_exp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is not a three-part JWT")]
    InvalidTokenFormat,
    #[error("unsupported JWT algorithm")]
    UnsupportedAlgorithm,
    #[error("token segment is not valid base64url")]
    InvalidBase64,
    #[error("token segment is not a JSON object")]
    InvalidJson,
    #[error("token signature mismatch")]
    InvalidSignature,
    #[error("token is missing claim '{0}'")]
    MissingClaim(&'static str),
    #[error("token claim '{0}' has the wrong type")]
    InvalidClaimType(&'static str),
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("token issuer mismatch")]
    IssuerMismatch,
    #[error("token audience mismatch")]
    AudienceMismatch,
}

/// Who is calling and on behalf of which company. Produced by the auth
/// collaborator; the feedback core only consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub company_code: String,
    pub user_id: String,
    pub user_name: Option<String>,
}

impl CallerIdentity {
    /// Name recorded in history entries: display name when known, else the id.
    pub fn actor(&self) -> &str {
        self.user_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.user_id)
    }
}

pub fn verify_hs256_token(
    token: &str,
    config: &JwtValidationConfig,
    now_unix_secs: u64,
) -> Result<CallerIdentity, TokenError> {
    let (header_b64, payload_b64, signature_b64) =
        split_jwt(token).ok_or(TokenError::InvalidTokenFormat)?;
    let signing_input = format!("{header_b64}.{payload_b64}");

    let header = decode_json_segment(header_b64)?;
    let alg = object_get_string(&header, "alg").ok_or(TokenError::MissingClaim("alg"))?;
    if alg != "HS256" {
        return Err(TokenError::UnsupportedAlgorithm);
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| TokenError::InvalidBase64)?;
    let signature_matches = candidate_secrets(config).into_iter().any(|secret| {
        let expected = hmac_sha256(secret.as_bytes(), signing_input.as_bytes());
        constant_time_eq(&signature, &expected)
    });
    if !signature_matches {
        return Err(TokenError::InvalidSignature);
    }

    let claims = decode_json_segment(payload_b64)?;

    if let Some(issuer) = config.issuer.as_deref() {
        let claim_issuer =
            object_get_string(&claims, "iss").ok_or(TokenError::MissingClaim("iss"))?;
        if claim_issuer != issuer {
            return Err(TokenError::IssuerMismatch);
        }
    }

    if let Some(audience) = config.audience.as_deref() {
        let audiences = object_get_string_or_string_array(&claims, "aud")?;
        if !audiences.iter().any(|value| value == audience) {
            return Err(TokenError::AudienceMismatch);
        }
    }

    let exp = object_get_u64(&claims, "exp")?;
    if config.require_exp && exp.is_none() {
        return Err(TokenError::MissingClaim("exp"));
    }
    if let Some(exp) = exp
        && now_unix_secs > exp.saturating_add(config.leeway_secs)
    {
        return Err(TokenError::Expired);
    }
    if let Some(nbf) = object_get_u64(&claims, "nbf")?
        && now_unix_secs.saturating_add(config.leeway_secs) < nbf
    {
        return Err(TokenError::NotYetValid);
    }

    identity_from_claims(&claims)
}

pub fn encode_hs256_token(claims_json: &str, secret: &str) -> Result<String, TokenError> {
    let claims: Value = serde_json::from_str(claims_json).map_err(|_| TokenError::InvalidJson)?;
    if !claims.is_object() {
        return Err(TokenError::InvalidJson);
    }
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims_json.as_bytes());
    let signing_input = format!("{header}.{payload}");
    let signature = hmac_sha256(secret.as_bytes(), signing_input.as_bytes());
    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
}

pub fn sha256_hex(input: &[u8]) -> String {
    Sha256::digest(input)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn identity_from_claims(claims: &Map<String, Value>) -> Result<CallerIdentity, TokenError> {
    let company_code = first_string_claim(claims, &["companyCode", "company_code"])?
        .ok_or(TokenError::MissingClaim("companyCode"))?;
    let user_id = first_string_claim(claims, &["sub", "userId"])?
        .ok_or(TokenError::MissingClaim("sub"))?;
    let user_name = first_string_claim(claims, &["name"])?;
    Ok(CallerIdentity {
        company_code,
        user_id,
        user_name,
    })
}

fn first_string_claim(
    claims: &Map<String, Value>,
    keys: &[&'static str],
) -> Result<Option<String>, TokenError> {
    for &key in keys {
        match claims.get(key) {
            None | Some(Value::Null) => continue,
            Some(Value::String(raw)) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return Ok(Some(trimmed.to_string()));
                }
            }
            Some(_) => return Err(TokenError::InvalidClaimType(key)),
        }
    }
    Ok(None)
}

fn candidate_secrets(config: &JwtValidationConfig) -> Vec<&str> {
    let mut out = Vec::with_capacity(1 + config.hs256_fallback_secrets.len());
    out.push(config.hs256_secret.as_str());
    for secret in &config.hs256_fallback_secrets {
        if !secret.is_empty() && !out.contains(&secret.as_str()) {
            out.push(secret.as_str());
        }
    }
    out
}

fn split_jwt(token: &str) -> Option<(&str, &str, &str)> {
    let mut parts = token.split('.');
    let header = parts.next()?;
    let payload = parts.next()?;
    let signature = parts.next()?;
    if parts.next().is_some() || header.is_empty() || payload.is_empty() || signature.is_empty() {
        return None;
    }
    Some((header, payload, signature))
}

fn decode_json_segment(segment: &str) -> Result<Map<String, Value>, TokenError> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::InvalidBase64)?;
    match serde_json::from_slice::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(TokenError::InvalidJson),
    }
}

fn object_get_string<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

fn object_get_u64(map: &Map<String, Value>, key: &'static str) -> Result<Option<u64>, TokenError> {
    match map.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or(TokenError::InvalidClaimType(key)),
    }
}

fn object_get_string_or_string_array(
    map: &Map<String, Value>,
    key: &'static str,
) -> Result<Vec<String>, TokenError> {
    match map.get(key) {
        None => Err(TokenError::MissingClaim(key)),
        Some(Value::String(raw)) => Ok(vec![raw.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(ToString::to_string)
                    .ok_or(TokenError::InvalidClaimType(key))
            })
            .collect(),
        Some(_) => Err(TokenError::InvalidClaimType(key)),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    const BLOCK_SIZE: usize = 64;
    let mut key_block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        let hashed = Sha256::digest(key);
        key_block[..hashed.len()].copy_from_slice(&hashed);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    inner.update(key_block.map(|byte| byte ^ 0x36));
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(key_block.map(|byte| byte ^ 0x5c));
    outer.update(inner_hash);
    outer.finalize().into()
}
