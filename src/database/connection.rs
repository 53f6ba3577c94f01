use log::{error, info};
use openssl::ssl::{SslConnector, SslMethod};
use postgres_openssl::MakeTlsConnector;
use tokio_postgres::{Client, NoTls};
use url::Url;

use super::StoreError;
use crate::config::RetryPolicy;
use crate::retry::with_retry;

/// TLS connector that verifies the server against the given root certificate
pub fn create_ssl_connector(sslrootcert_path: &str) -> Result<MakeTlsConnector, StoreError> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|e| StoreError::Connection(format!("SSL builder error: {}", e)))?;

    builder
        .set_ca_file(sslrootcert_path)
        .map_err(|e| StoreError::Connection(format!("Error loading CA cert: {}", e)))?;

    Ok(MakeTlsConnector::new(builder.build()))
}

/// Split the `sslrootcert` parameter out of a connection URL
///
/// libpq understands `sslrootcert`, tokio-postgres does not, so it is removed
/// from the query string and handed to the TLS connector instead.
pub fn split_sslrootcert(database_url: &str) -> Result<(String, Option<String>), StoreError> {
    let url = Url::parse(database_url)
        .map_err(|e| StoreError::Connection(format!("URL parse error: {}", e)))?;

    let mut sslrootcert_path = None;
    let mut clean_params = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == "sslrootcert" {
            sslrootcert_path = Some(value.to_string());
        } else {
            clean_params.push((key.into_owned(), value.into_owned()));
        }
    }

    let mut clean_url = url.clone();
    clean_url.set_query(None);
    if !clean_params.is_empty() {
        let query = clean_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        clean_url.set_query(Some(&query));
    }

    Ok((clean_url.to_string(), sslrootcert_path))
}

/// Open one client connection, TLS when a root certificate is configured
pub async fn connect(database_url: &str) -> Result<Client, StoreError> {
    let (clean_database_url, sslrootcert_path) = split_sslrootcert(database_url)?;

    let client = match sslrootcert_path {
        Some(path) => {
            let connector = create_ssl_connector(&path)?;
            let (client, connection) = tokio_postgres::connect(&clean_database_url, connector)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            client
        }
        None => {
            info!("No sslrootcert configured, connecting without TLS");
            let (client, connection) = tokio_postgres::connect(&clean_database_url, NoTls)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            client
        }
    };

    Ok(client)
}

/// Open a client, retrying transient connection failures
pub async fn connect_with_retry(
    database_url: &str,
    policy: RetryPolicy,
) -> Result<Client, StoreError> {
    with_retry(policy, "Database connection", || connect(database_url)).await
}
