//! Thin functional wrapper over the durable token store. The adapter owns
//! nothing persistently; every call maps straight through to a query
//! against whatever's behind the `Store` trait.

use async_trait::async_trait;
use auth_entity::{AuthError, Filter, Operator, Token, TokenType};
use event_bus::{Dispatcher, Envelope, UserDeletedPayload, USER_DELETED};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, id: &str) -> Result<Token, AuthError>;
    async fn get_multiple(&self, filter: &Filter) -> Result<Vec<Token>, AuthError>;
    async fn create(&self, token: &Token) -> Result<(), AuthError>;
    async fn delete(&self, id: &str) -> Result<(), AuthError>;
    async fn close(&self) -> Result<(), AuthError>;
}

pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_token(row: &sqlx::postgres::PgRow) -> Result<Token, AuthError> {
    let type_str: String = row.try_get("token_type").map_err(|e| AuthError::StoreFailure(e.to_string()))?;
    let token_type = TokenType::parse(&type_str)
        .ok_or_else(|| AuthError::StoreFailure(format!("unrecognized token_type {type_str}")))?;
    Ok(Token {
        id: row.try_get("id").map_err(|e| AuthError::StoreFailure(e.to_string()))?,
        user_id: row.try_get("user_id").map_err(|e| AuthError::StoreFailure(e.to_string()))?,
        token_type,
        issued_at: row.try_get("issued_at").map_err(|e| AuthError::StoreFailure(e.to_string()))?,
        expires_at: row.try_get("expires_at").map_err(|e| AuthError::StoreFailure(e.to_string()))?,
    })
}

/// Only columns the core actually filters on are addressable; this is the
/// adapter's SQL-injection boundary (`Filter::attribute` is otherwise an
/// arbitrary caller-supplied string).
fn column_for(attribute: &str) -> Result<&'static str, AuthError> {
    match attribute {
        "id" => Ok("id"),
        "user_id" => Ok("user_id"),
        _ => Err(AuthError::StoreFailure(format!("unfilterable attribute: {attribute}"))),
    }
}

fn operator_sql(operator: Operator) -> &'static str {
    operator.as_sql()
}

#[async_trait]
impl Store for PgTokenStore {
    async fn get(&self, id: &str) -> Result<Token, AuthError> {
        let row = sqlx::query("SELECT id, user_id, token_type, issued_at, expires_at FROM tokens WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AuthError::StoreFailure(e.to_string()))?
            .ok_or(AuthError::KeyNotFound)?;
        row_to_token(&row)
    }

    async fn get_multiple(&self, filter: &Filter) -> Result<Vec<Token>, AuthError> {
        let column = column_for(&filter.attribute)?;
        let query = format!(
            "SELECT id, user_id, token_type, issued_at, expires_at FROM tokens WHERE {column} {} $1",
            operator_sql(filter.operator)
        );
        let rows = sqlx::query(&query)
            .bind(&filter.value)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AuthError::StoreFailure(e.to_string()))?;
        rows.iter().map(row_to_token).collect()
    }

    async fn create(&self, token: &Token) -> Result<(), AuthError> {
        sqlx::query(
            "INSERT INTO tokens (id, user_id, token_type, issued_at, expires_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&token.id)
        .bind(&token.user_id)
        .bind(token.token_type.claim_str())
        .bind(token.issued_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AuthError::StoreFailure(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AuthError> {
        sqlx::query("DELETE FROM tokens WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AuthError::StoreFailure(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), AuthError> {
        self.pool.close().await;
        Ok(())
    }
}

/// Cascade-deletes every token owned by a deleted user. Registered against
/// the event bus dispatcher at composition time, not called directly.
pub async fn on_user_deleted(store: &dyn Store, user_id: &str) -> Result<(), AuthError> {
    let tokens = store.get_multiple(&Filter::user_id_eq(user_id)).await?;
    for token in &tokens {
        store.delete(&token.id).await?;
    }
    info!(user_id, deleted = tokens.len(), "cascade-deleted tokens for removed user");
    Ok(())
}

/// Wires `on_user_deleted` to the bus so the store reacts to `user_deleted`
/// without the caller needing to know the wire event shape.
pub async fn register_user_deleted_handler(
    dispatcher: &Dispatcher,
    store: Arc<dyn Store>,
) -> Result<(), event_bus::EventBusError> {
    dispatcher
        .register(
            USER_DELETED,
            Arc::new(move |envelope: Envelope| {
                let store = store.clone();
                Box::pin(async move {
                    let payload: UserDeletedPayload = match envelope.payload_as() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "undecodable user_deleted payload");
                            return;
                        }
                    };
                    if let Err(e) = on_user_deleted(store.as_ref(), &payload.user_id).await {
                        warn!(error = %e, user_id = %payload.user_id, "failed to cascade-delete tokens");
                    }
                })
            }),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth_entity::TokenType;
    use chrono::Utc;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct InMemoryStore {
        tokens: Mutex<HashMap<String, Token>>,
    }

    #[async_trait]
    impl Store for InMemoryStore {
        async fn get(&self, id: &str) -> Result<Token, AuthError> {
            self.tokens.lock().await.get(id).cloned().ok_or(AuthError::KeyNotFound)
        }

        async fn get_multiple(&self, filter: &Filter) -> Result<Vec<Token>, AuthError> {
            let column = column_for(&filter.attribute)?;
            Ok(self
                .tokens
                .lock()
                .await
                .values()
                .filter(|t| {
                    let actual = match column {
                        "id" => &t.id,
                        "user_id" => &t.user_id,
                        _ => unreachable!(),
                    };
                    match filter.operator {
                        Operator::Eq => actual == &filter.value,
                        Operator::Ne => actual != &filter.value,
                        _ => false,
                    }
                })
                .cloned()
                .collect())
        }

        async fn create(&self, token: &Token) -> Result<(), AuthError> {
            self.tokens.lock().await.insert(token.id.clone(), token.clone());
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<(), AuthError> {
            self.tokens.lock().await.remove(id);
            Ok(())
        }

        async fn close(&self) -> Result<(), AuthError> {
            Ok(())
        }
    }

    fn token(id: &str, user_id: &str) -> Token {
        Token::new(id, user_id, TokenType::Refresh, Utc::now(), chrono::Duration::hours(1))
    }

    #[tokio::test]
    async fn on_user_deleted_cascades_all_of_the_users_tokens() {
        let store = InMemoryStore::default();
        store.create(&token("t1", "u1")).await.unwrap();
        store.create(&token("t2", "u1")).await.unwrap();
        store.create(&token("t3", "u2")).await.unwrap();

        on_user_deleted(&store, "u1").await.unwrap();

        assert!(store.get("t1").await.is_err());
        assert!(store.get("t2").await.is_err());
        assert!(store.get("t3").await.is_ok());
    }

    #[tokio::test]
    async fn register_user_deleted_handler_reacts_to_bus_event() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        store.create(&token("t1", "u1")).await.unwrap();

        let bus = Arc::new(event_bus::InMemoryEventBus::new());
        let dispatcher = Dispatcher::new(bus.clone() as Arc<dyn event_bus::EventBus>, "token-store");
        register_user_deleted_handler(&dispatcher, store.clone()).await.unwrap();

        bus.publish(Envelope::new("test", USER_DELETED, UserDeletedPayload { user_id: "u1".into() }).unwrap())
            .await
            .unwrap();

        // Give the dispatcher's background task a beat to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(store.get("t1").await.is_err());
    }
}
