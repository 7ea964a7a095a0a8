use crate::Result;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::ImageExt;
use testcontainers::{ContainerAsync, GenericImage};
use typed_builder::TypedBuilder;

const MYSQL_IMAGE: &str = "mysql";
const MYSQL_PORT: u16 = 3306;

/// Credentials and image of the MySQL server backing `MySqlStore` tests.
#[derive(Debug, Clone, TypedBuilder)]
pub struct MysqlConfig {
    /// Schema the burrow migrations are applied to.
    #[builder(default = "burrow".to_string())]
    database: String,
    /// Unprivileged user owning `database`; the store connects as this user.
    #[builder(default = "burrow".to_string())]
    username: String,
    #[builder(default = "burrow".to_string())]
    password: String,
    #[builder(default = "root".to_string())]
    root_password: String,
    /// Tag of the `mysql` image to run.
    #[builder(default = "8.4".to_string())]
    image_tag: String,
}

/// Throwaway MySQL container holding the `short_urls` schema under test.
///
/// The container is removed when this value is dropped, so keep it alive for
/// as long as a `MySqlStore` points at it. MySQL prints "ready for
/// connections" for its bootstrap instance before the real server is up;
/// connect with a few retries before running `migrate`.
pub struct MySqlServer {
    container: ContainerAsync<GenericImage>,
    config: MysqlConfig,
}

impl MySqlServer {
    /// Starts the container and waits for the server log line.
    pub async fn new(config: MysqlConfig) -> Result<Self> {
        let container = GenericImage::new(MYSQL_IMAGE, config.image_tag.as_str())
            .with_exposed_port(MYSQL_PORT.tcp())
            .with_wait_for(WaitFor::message_on_stderr("ready for connections"))
            .with_env_var("MYSQL_DATABASE", config.database.as_str())
            .with_env_var("MYSQL_USER", config.username.as_str())
            .with_env_var("MYSQL_PASSWORD", config.password.as_str())
            .with_env_var("MYSQL_ROOT_PASSWORD", config.root_password.as_str())
            .start()
            .await?;

        Ok(Self { container, config })
    }

    pub async fn host(&self) -> Result<String> {
        Ok(self.container.get_host().await?.to_string())
    }

    /// Host port mapped to the server's 3306.
    pub async fn port(&self) -> Result<u16> {
        Ok(self.container.get_host_port_ipv4(MYSQL_PORT).await?)
    }

    /// DSN accepted by `MySqlStoreConfig::url`, logged in as the burrow user.
    pub async fn database_url(&self) -> Result<String> {
        let host = self.host().await?;
        let port = self.port().await?;
        Ok(format!(
            "mysql://{}:{}@{}:{}/{}",
            self.config.username, self.config.password, host, port, self.config.database
        ))
    }
}
