//! Client for the external user directory. The directory owns accounts and
//! password hashes; this crate only names the one operation the core
//! consumes from it.

pub mod dfr {
    pub mod user {
        pub mod v1 {
            tonic::include_proto!("dfr.user.v1");
        }
    }
}

pub use dfr::user::v1::*;

use async_trait::async_trait;
use auth_entity::AuthError;
use dfr::user::v1::get_secret_request::Identifier;
use dfr::user::v1::user_directory_client::UserDirectoryClient;
use tonic::transport::Channel;

pub enum UserIdentifier {
    Email(String),
    Id(String),
}

#[derive(Debug, Clone)]
pub struct UserSecret {
    pub id: String,
    pub password_hash: String,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_secret(&self, identifier: UserIdentifier) -> Result<UserSecret, AuthError>;
}

pub struct GrpcUserDirectory {
    client: UserDirectoryClient<Channel>,
}

impl GrpcUserDirectory {
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self, tonic::transport::Error> {
        let client = UserDirectoryClient::connect(endpoint.into()).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UserDirectory for GrpcUserDirectory {
    async fn get_secret(&self, identifier: UserIdentifier) -> Result<UserSecret, AuthError> {
        let mut client = self.client.clone();
        let request = GetSecretRequest {
            identifier: Some(match identifier {
                UserIdentifier::Email(email) => Identifier::Email(email),
                UserIdentifier::Id(id) => Identifier::Id(id),
            }),
        };

        let response = client.get_secret(request).await.map_err(|status| match status.code() {
            tonic::Code::NotFound => AuthError::AuthFailed,
            _ => AuthError::StoreFailure(format!("user directory lookup failed: {status}")),
        })?;

        let secret = response.into_inner();
        Ok(UserSecret { id: secret.id, password_hash: secret.password_hash })
    }
}
