//! Request authentication.
//!
//! A typegraph declares its providers in `meta.auths`. `Bearer` tokens are
//! checked against the JWT providers, `Basic` credentials against the basic
//! provider. Accepted credentials become the claims of the query context;
//! requests without credentials get empty claims.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use jsonwebtoken::decode;
use jsonwebtoken::Algorithm;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::Validation;
use subtle::ConstantTimeEq;

use crate::error::AuthenticationError;
use crate::error::SchemaError;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::typegraph::AuthProtocol;
use crate::typegraph::AuthProvider;
use crate::SecretStore;

const PROVIDER_CLAIM: &str = "provider";

struct JwtProvider {
    name: String,
    key: DecodingKey,
    algorithm: Algorithm,
}

struct BasicUser {
    name: String,
    password: String,
}

#[derive(Default)]
pub(crate) struct Authenticator {
    jwt: Vec<JwtProvider>,
    basic: Vec<BasicUser>,
}

impl Authenticator {
    /// Resolves the keys and passwords of `providers` from `secrets`.
    pub(crate) fn new(
        providers: &[AuthProvider],
        secrets: &dyn SecretStore,
    ) -> Result<Self, SchemaError> {
        let mut authenticator = Authenticator::default();
        for provider in providers {
            let invalid = |reason: String| SchemaError::InvalidAuth {
                provider: provider.name.clone(),
                reason,
            };
            match provider.protocol {
                AuthProtocol::Jwt => {
                    let secret = format!("{}_JWT", provider.name.to_uppercase());
                    let key = secrets
                        .get(&secret)
                        .ok_or_else(|| invalid(format!("missing secret {secret}")))?;
                    let algorithm = match provider.auth_data.get("algorithm") {
                        Some(Value::String(algorithm)) => algorithm
                            .as_str()
                            .parse::<Algorithm>()
                            .map_err(|e| invalid(e.to_string()))?,
                        Some(other) => return Err(invalid(format!("invalid algorithm {other}"))),
                        None => Algorithm::HS256,
                    };
                    if !matches!(
                        algorithm,
                        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
                    ) {
                        return Err(invalid(format!("unsupported algorithm {algorithm:?}")));
                    }
                    authenticator.jwt.push(JwtProvider {
                        name: provider.name.clone(),
                        key: DecodingKey::from_secret(key.as_bytes()),
                        algorithm,
                    });
                }
                AuthProtocol::Basic => {
                    let users = provider
                        .auth_data
                        .get("users")
                        .and_then(Value::as_array)
                        .ok_or_else(|| invalid("missing users".to_string()))?;
                    for user in users.iter().filter_map(Value::as_str) {
                        let secret = format!("BASIC_{}", user.to_uppercase());
                        let password = secrets
                            .get(&secret)
                            .ok_or_else(|| invalid(format!("missing secret {secret}")))?;
                        authenticator.basic.push(BasicUser {
                            name: user.to_string(),
                            password,
                        });
                    }
                }
            }
        }
        Ok(authenticator)
    }

    /// The claims carried by the `Authorization` header.
    pub(crate) fn authenticate(&self, headers: &HeaderMap) -> Result<Object, AuthenticationError> {
        let Some(header) = headers.get(AUTHORIZATION) else {
            return Ok(Object::new());
        };
        let header = header
            .to_str()
            .map_err(|_| AuthenticationError::MalformedHeader)?;
        let (scheme, credentials) = header
            .split_once(' ')
            .ok_or(AuthenticationError::MalformedHeader)?;
        match scheme.to_ascii_lowercase().as_str() {
            "bearer" => self.authenticate_jwt(credentials.trim()),
            "basic" => self.authenticate_basic(credentials.trim()),
            _ => Err(AuthenticationError::UnsupportedScheme(scheme.to_string())),
        }
    }

    fn authenticate_jwt(&self, token: &str) -> Result<Object, AuthenticationError> {
        if self.jwt.is_empty() {
            return Err(AuthenticationError::NoProvider("jwt".to_string()));
        }
        let mut error = None;
        for provider in &self.jwt {
            let mut validation = Validation::new(provider.algorithm);
            validation.validate_nbf = true;
            validation.validate_aud = false;
            validation.set_required_spec_claims::<&str>(&[]);
            match decode::<Object>(token, &provider.key, &validation) {
                Ok(data) => {
                    let mut claims = data.claims;
                    claims.insert(PROVIDER_CLAIM, Value::from(provider.name.as_str()));
                    tracing::debug!(provider = %provider.name, "bearer token accepted");
                    return Ok(claims);
                }
                Err(e) => error = Some(e),
            }
        }
        Err(AuthenticationError::InvalidToken(
            error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    fn authenticate_basic(&self, credentials: &str) -> Result<Object, AuthenticationError> {
        if self.basic.is_empty() {
            return Err(AuthenticationError::NoProvider("basic".to_string()));
        }
        let decoded = BASE64
            .decode(credentials)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or(AuthenticationError::MalformedHeader)?;
        let (name, password) = decoded
            .split_once(':')
            .ok_or(AuthenticationError::MalformedHeader)?;
        let user = self
            .basic
            .iter()
            .find(|user| user.name == name && passwords_match(&user.password, password))
            .ok_or_else(|| AuthenticationError::InvalidCredentials(name.to_string()))?;

        let mut claims = Object::new();
        claims.insert("user", Value::from(user.name.as_str()));
        claims.insert(PROVIDER_CLAIM, Value::from("basic"));
        Ok(claims)
    }
}

/// Compares passwords in constant time for equal lengths.
fn passwords_match(expected: &str, actual: &str) -> bool {
    expected.as_bytes().ct_eq(actual.as_bytes()).into()
}
