use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::{Connection, PgConnection};
use tokio::time::{Instant, sleep};

const POSTGRES_IMAGE: &str = "postgres:16.6";
const READY_DEADLINE: Duration = Duration::from_secs(30);
const READY_POLL: Duration = Duration::from_millis(250);

static CONTAINER_SEQ: AtomicU32 = AtomicU32::new(0);

/// Throwaway Postgres server in Docker.
///
/// The container runs with trust auth on a loopback port that Docker picks;
/// `kill` and `restart` reuse that port, so a reconnecting manager finds the
/// replacement server behind the unchanged DSN. Advisory locks need no
/// schema, so everything runs against the stock `postgres` database.
pub struct TestPostgres {
    name: String,
    port: u16,
}

impl TestPostgres {
    pub async fn start(prefix: &str) -> Result<Self> {
        let name = format!(
            "{prefix}-{}-{}",
            std::process::id(),
            CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        run_server(&name, None)?;
        let port = match published_port(&name) {
            Ok(port) => port,
            Err(err) => {
                docker(&["rm", "-f", &name]).ok();
                return Err(err);
            }
        };
        let server = Self { name, port };
        // Dropping on the error path tears the container down again.
        server.await_ready().await?;
        Ok(server)
    }

    pub fn url(&self) -> String {
        format!("postgres://postgres@127.0.0.1:{}/postgres", self.port)
    }

    /// Kills the server out from under its clients.
    pub fn kill(&self) -> Result<()> {
        docker(&["rm", "-f", &self.name]).map(drop)
    }

    /// Brings a replacement server up behind the same port.
    pub async fn restart(&self) -> Result<()> {
        run_server(&self.name, Some(self.port))?;
        self.await_ready().await
    }

    pub fn cleanup(self) -> Result<()> {
        docker(&["rm", "-f", &self.name]).map(drop)
    }

    /// Polls until the server accepts connections from the host.
    ///
    /// `pg_isready` inside the container filters out the boot phase cheaply;
    /// the actual connection proves the published port works too.
    async fn await_ready(&self) -> Result<()> {
        let deadline = Instant::now() + READY_DEADLINE;
        loop {
            if docker(&["exec", &self.name, "pg_isready", "-U", "postgres"]).is_ok() {
                if let Ok(conn) = PgConnection::connect(&self.url()).await {
                    conn.close().await.ok();
                    return Ok(());
                }
            }
            if Instant::now() > deadline {
                bail!(
                    "postgres container '{}' not ready within {READY_DEADLINE:?}",
                    self.name
                );
            }
            sleep(READY_POLL).await;
        }
    }
}

impl Drop for TestPostgres {
    fn drop(&mut self) {
        docker(&["rm", "-f", &self.name]).ok();
    }
}

fn run_server(name: &str, port: Option<u16>) -> Result<()> {
    // First boot lets Docker pick the host port; restarts pin the one the
    // original boot was given.
    let publish = match port {
        Some(port) => format!("127.0.0.1:{port}:5432"),
        None => "127.0.0.1:0:5432".to_owned(),
    };
    docker(&[
        "run",
        "--rm",
        "-d",
        "--name",
        name,
        "-e",
        "POSTGRES_HOST_AUTH_METHOD=trust",
        "-p",
        &publish,
        POSTGRES_IMAGE,
    ])
    .map(drop)
}

/// Asks Docker which host port it bound for the server socket.
fn published_port(name: &str) -> Result<u16> {
    let mapping = docker(&["port", name, "5432/tcp"])?;
    mapping
        .lines()
        .find_map(|line| line.rsplit(':').next()?.trim().parse::<u16>().ok())
        .with_context(|| format!("unparsable port mapping for '{name}': {mapping:?}"))
}

/// Runs one docker command, handing back stdout; failures carry stderr.
fn docker(args: &[&str]) -> Result<String> {
    let output = Command::new("docker")
        .args(args)
        .output()
        .context("docker is not runnable")?;
    if !output.status.success() {
        bail!(
            "docker {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
