/// 连接认证
///
/// 认证机制可插拔：连接管理器只关心“准入 / 拒绝”以及可选的用户身份

use async_trait::async_trait;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 认证后的连接身份
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("缺少认证令牌")]
    MissingToken,

    #[error("令牌无效: {0}")]
    InvalidToken(String),
}

/// 认证检查
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError>;
}

/// 放行所有连接（单机开发环境）
pub struct AllowAnonymous;

#[async_trait]
impl Authenticator for AllowAnonymous {
    async fn authenticate(&self, _token: Option<&str>) -> Result<Identity, AuthError> {
        Ok(Identity::anonymous())
    }
}

/// JWT 载荷
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// 基于 HS256 JWT 的认证
///
/// 缺少令牌仅在 `required` 时拒绝；携带的令牌无效则总是拒绝
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
    required: bool,
}

impl JwtAuthenticator {
    pub fn new(secret: &str, required: bool) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
            required,
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let token = match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token) => token,
            None if self.required => return Err(AuthError::MissingToken),
            None => return Ok(Identity::anonymous()),
        };

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        Ok(Identity::user(data.claims.sub))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub(crate) fn issue_token(secret: &str, sub: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_yields_identity() {
        let auth = JwtAuthenticator::new("secret", true);
        let token = issue_token("secret", "user-42");
        let identity = auth.authenticate(Some(&token)).await.unwrap();
        assert_eq!(identity, Identity::user("user-42"));
    }

    #[tokio::test]
    async fn test_missing_token() {
        let required = JwtAuthenticator::new("secret", true);
        assert!(matches!(
            required.authenticate(None).await,
            Err(AuthError::MissingToken)
        ));

        let optional = JwtAuthenticator::new("secret", false);
        assert_eq!(optional.authenticate(None).await.unwrap(), Identity::anonymous());
    }

    #[tokio::test]
    async fn test_invalid_token_always_rejected() {
        let auth = JwtAuthenticator::new("secret", false);
        let forged = issue_token("other-secret", "mallory");
        assert!(matches!(
            auth.authenticate(Some(&forged)).await,
            Err(AuthError::InvalidToken(_))
        ));
    }
}
