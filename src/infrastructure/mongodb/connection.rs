use std::time::Duration;

use mongodb::{
    options::{
        Acknowledgment, ClientOptions, Credential, ReadConcern, ReadPreference, ReadPreferenceOptions,
        SelectionCriteria, WriteConcern,
    },
    Client, Database,
};
use tracing::{debug, error, info};

use crate::{
    config::StoreSettings,
    domain::{
        error::IngestionError,
        models::{ConnectionMode, ConsistencyLevel},
    },
};

const APP_NAME: &str = "blob-bulk-ingest";

// Cloning shares the pool.
#[derive(Clone, Debug)]
pub struct StoreConnection {
    client: Client,
}

impl StoreConnection {
    pub fn database(&self, name: &str) -> Database {
        self.client.database(name)
    }
}

pub fn endpoint_for(template: &str, account_name: &str) -> String {
    template.replace("{account}", account_name)
}

// The pool connects on first use.
pub async fn connect(settings: &StoreSettings) -> Result<StoreConnection, IngestionError> {
    if settings.account_name.is_empty() || settings.account_key.is_empty() {
        return Err(IngestionError::Connection(
            "account name and key are required".to_string(),
        ));
    }

    let endpoint = endpoint_for(&settings.endpoint_template, &settings.account_name);
    debug!("Building store client for endpoint: {}", endpoint);

    let mut options = ClientOptions::parse(&endpoint).await.map_err(|e| {
        error!("Invalid store endpoint {}: {}", endpoint, e);
        IngestionError::Connection(e.to_string())
    })?;

    options.app_name = Some(APP_NAME.to_string());
    options.max_pool_size = Some(settings.max_pool_size);
    options.direct_connection = Some(settings.connection_mode == ConnectionMode::Direct);
    options.connect_timeout = Some(Duration::from_secs(settings.connect_timeout_secs));
    options.server_selection_timeout = Some(Duration::from_secs(settings.connect_timeout_secs));
    options.credential = Some(
        Credential::builder()
            .username(settings.account_name.clone())
            .password(settings.account_key.clone())
            .build(),
    );

    let policy = ConsistencyPolicy::for_level(settings.consistency_level);
    options.read_concern = Some(policy.read_concern);
    options.write_concern = Some(policy.write_concern);
    options.selection_criteria = Some(SelectionCriteria::ReadPreference(policy.read_preference));

    let client = Client::with_options(options).map_err(|e| {
        error!("Failed to build store client: {}", e);
        IngestionError::Connection(e.to_string())
    })?;

    info!(
        "Store client ready: mode={:?}, pool={}, consistency={:?}",
        settings.connection_mode, settings.max_pool_size, settings.consistency_level
    );

    Ok(StoreConnection { client })
}

#[derive(Debug, Clone)]
pub struct ConsistencyPolicy {
    pub read_concern: ReadConcern,
    pub write_concern: WriteConcern,
    pub read_preference: ReadPreference,
}

impl ConsistencyPolicy {
    pub fn for_level(level: ConsistencyLevel) -> Self {
        let majority = WriteConcern::builder().w(Acknowledgment::Majority).build();
        let single = WriteConcern::builder().w(Acknowledgment::Nodes(1)).build();
        let primary = ReadPreference::Primary;

        match level {
            ConsistencyLevel::Strong => Self {
                read_concern: ReadConcern::linearizable(),
                write_concern: majority,
                read_preference: primary,
            },
            ConsistencyLevel::BoundedStaleness => Self {
                read_concern: ReadConcern::majority(),
                write_concern: majority,
                read_preference: ReadPreference::PrimaryPreferred {
                    options: ReadPreferenceOptions::default(),
                },
            },
            ConsistencyLevel::Session => Self {
                read_concern: ReadConcern::local(),
                write_concern: single,
                read_preference: primary,
            },
            ConsistencyLevel::ConsistentPrefix => Self {
                read_concern: ReadConcern::local(),
                write_concern: single,
                read_preference: ReadPreference::PrimaryPreferred {
                    options: ReadPreferenceOptions::default(),
                },
            },
            ConsistencyLevel::Eventual => Self {
                read_concern: ReadConcern::available(),
                write_concern: single,
                read_preference: ReadPreference::Nearest {
                    options: ReadPreferenceOptions::default(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::options::ReadConcernLevel;
    use test_log::test;

    fn settings() -> StoreSettings {
        StoreSettings {
            account_name: "splitproof".into(),
            account_key: "c2VjcmV0".into(),
            endpoint_template: "mongodb://{account}.example.net:10255/?tls=true".into(),
            ..StoreSettings::default()
        }
    }

    #[test]
    fn endpoint_template_is_filled() {
        assert_eq!(
            endpoint_for("https://{account}.documents.azure.com:443/", "abc"),
            "https://abc.documents.azure.com:443/"
        );
    }

    #[test]
    fn eventual_trades_ordering_for_throughput() {
        let policy = ConsistencyPolicy::for_level(ConsistencyLevel::Eventual);
        assert_eq!(policy.read_concern.level, ReadConcernLevel::Available);
        assert_eq!(policy.write_concern.w, Some(Acknowledgment::Nodes(1)));
        assert!(matches!(policy.read_preference, ReadPreference::Nearest { .. }));
    }

    #[test]
    fn strong_requires_majority() {
        let policy = ConsistencyPolicy::for_level(ConsistencyLevel::Strong);
        assert_eq!(policy.read_concern.level, ReadConcernLevel::Linearizable);
        assert_eq!(policy.write_concern.w, Some(Acknowledgment::Majority));
        assert!(matches!(policy.read_preference, ReadPreference::Primary));
    }

    #[test(tokio::test)]
    async fn connect_is_lazy() {
        let connection = connect(&settings()).await.unwrap();
        let _ = connection.database("ingest");
    }

    #[test(tokio::test)]
    async fn malformed_endpoint_is_a_connection_error() {
        let mut settings = settings();
        settings.endpoint_template = "not a uri {account}".into();
        let err = connect(&settings).await.unwrap_err();
        assert!(matches!(err, IngestionError::Connection(_)));
    }

    #[test(tokio::test)]
    async fn missing_key_is_a_connection_error() {
        let mut settings = settings();
        settings.account_key.clear();
        assert!(matches!(connect(&settings).await, Err(IngestionError::Connection(_))));
    }
}
