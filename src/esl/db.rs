//! Access to the switch's `mod_db` key/value store

use async_trait::async_trait;

use super::{EslConnection, EslError};

/// Realm/key/value storage kept by the switch
#[async_trait]
pub trait KeyValueStore: Send {
    async fn db_insert(&mut self, realm: &str, key: &str, value: &str) -> Result<(), EslError>;

    async fn db_delete(&mut self, realm: &str, key: &str) -> Result<(), EslError>;

    async fn db_select(&mut self, realm: &str, key: &str) -> Result<String, EslError>;

    async fn db_exists(&mut self, realm: &str, key: &str) -> Result<bool, EslError>;
}

#[async_trait]
impl KeyValueStore for EslConnection {
    async fn db_insert(&mut self, realm: &str, key: &str, value: &str) -> Result<(), EslError> {
        self.api(&format!("db insert/{}/{}/{}", realm, key, value))
            .await
            .map(|_| ())
    }

    async fn db_delete(&mut self, realm: &str, key: &str) -> Result<(), EslError> {
        self.api(&format!("db delete/{}/{}", realm, key))
            .await
            .map(|_| ())
    }

    async fn db_select(&mut self, realm: &str, key: &str) -> Result<String, EslError> {
        self.api(&format!("db select/{}/{}", realm, key)).await
    }

    async fn db_exists(&mut self, realm: &str, key: &str) -> Result<bool, EslError> {
        let body = self.api(&format!("db exists/{}/{}", realm, key)).await?;
        Ok(body.trim() == "true")
    }
}
