use crate::error::{CopyError, Result};
use mongodb::options::{ClientOptions, Credential as MongoCredential};
use mongodb::sync::{Client, Database};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::debug;

/// Username and password used to authenticate against an endpoint.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    /// user name.
    pub username: String,
    /// password.
    pub password: String,
    /// authentication database, mongodb uses `admin` when it's None.
    pub source: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"***")
            .field("source", &self.source)
            .finish()
    }
}

/// A mongodb endpoint: connection string plus optional credential.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// connection string, begins with 'mongodb://' or 'mongodb+srv://'.
    pub uri: String,
    /// credential which overrides the one in `uri`.
    pub credential: Option<Credential>,
}

impl Endpoint {
    /// create an endpoint which authenticates with whatever `uri` contains.
    pub fn new(uri: impl Into<String>) -> Self {
        Endpoint {
            uri: uri.into(),
            credential: None,
        }
    }

    /// attach `credential` to this endpoint.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }
}

/// Caches one mongodb client per endpoint.
///
/// Mongodb clients hold a connection pool, so they are created once and shared by every copy
/// which talks to the same endpoint with the same credential.
#[derive(Default)]
pub struct ClientCache {
    clients: Mutex<HashMap<Endpoint, Client>>,
}

impl ClientCache {
    /// create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// get client for `endpoint`, connect when it's not cached yet.
    pub fn get_client(&self, endpoint: &Endpoint) -> Result<Client> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(endpoint) {
            return Ok(client.clone());
        }

        debug!(uri = %endpoint.uri, "Create new mongodb client");
        let mut options = ClientOptions::parse(&endpoint.uri)?;
        if let Some(credential) = &endpoint.credential {
            let mut mongo_credential = MongoCredential::default();
            mongo_credential.username = Some(credential.username.clone());
            mongo_credential.password = Some(credential.password.clone());
            mongo_credential.source = credential.source.clone();
            options.credential = Some(mongo_credential);
        }
        let client = Client::with_options(options)?;
        clients.insert(endpoint.clone(), client.clone());
        Ok(client)
    }

    /// get database `name` on `endpoint`.
    pub fn get_database(&self, endpoint: &Endpoint, name: &str) -> Result<Database> {
        Ok(self.get_client(endpoint)?.database(name))
    }

    /// Check if we can list collections of database `db` on `endpoint`.
    pub fn check_permission(&self, endpoint: &Endpoint, db: &str) -> Result<()> {
        let database = self.get_database(endpoint, db)?;
        if let Err(e) = database.list_collection_names(None) {
            return Err(CopyError::PermissionError {
                uri: endpoint.uri.clone(),
                db: db.to_string(),
                detail: e,
            });
        }
        Ok(())
    }
}
