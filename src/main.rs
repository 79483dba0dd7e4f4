use charon::config::Config;
use charon::content_manager::ContentManager;
use clap::{Arg, Command};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let matches = Command::new("charon")
        .version("0.1.0")
        .about("Upstream content manager for a forward proxy")
        .arg(
            Arg::new("web-html")
                .long("web-html")
                .value_name("PATH")
                .help("Root directory served for local file requests"),
        )
        .arg(
            Arg::new("admin-bind")
                .long("admin-bind")
                .value_name("ADDRESS:PORT")
                .help("Bind address for the health/metrics HTTP server")
                .default_value("127.0.0.1:9191"),
        )
        .get_matches();

    let mut config = Config::default();
    if let Some(path) = matches.get_one::<String>("web-html") {
        config.web_html = std::fs::canonicalize(PathBuf::from(path)).unwrap_or_else(|_| PathBuf::from(path));
    }

    let admin_bind: SocketAddr = matches
        .get_one::<String>("admin-bind")
        .unwrap()
        .parse()
        .expect("invalid --admin-bind address");

    // The verb decision engine that drives `ContentManager::get_content`
    // over a live `Poller` is a separate, surrounding reactor (spec.md
    // §1's external collaborator) outside this crate's scope; this binary
    // only stands up the ambient metrics/health surface for that reactor
    // to sit behind.
    let manager = ContentManager::new(config);
    let metrics = Arc::new(manager.metrics().clone());

    tracing::info!(%admin_bind, "starting charon content manager");
    charon::http_server::serve(admin_bind, metrics).await?;

    Ok(())
}
