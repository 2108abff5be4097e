use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use openshunt::app::watch::RuleWatcher;
use openshunt::app::App;
use openshunt::common::Address;
use openshunt::proxy::Session;

#[derive(Parser)]
#[command(name = "openshunt", version, about = "Traffic routing kernel")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 打印目标的分流决策和选中的出站
    Route {
        /// host:port 形式的目标
        #[arg(required = true)]
        targets: Vec<String>,
        /// 按 UDP 路由
        #[arg(long)]
        udp: bool,
        /// 显式路由 tag
        #[arg(long)]
        tag: Option<String>,
    },
    /// 常驻运行，规则文件变化时自动重载
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = openshunt::config::load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();
    info!(config = %cli.config.display(), "openshunt starting");

    let app = App::new(config)?;

    match cli.command {
        Command::Route { targets, udp, tag } => {
            for target in targets {
                let address = Address::parse(&target)?;
                let mut session = if udp {
                    Session::udp(address)
                } else {
                    Session::tcp(address)
                };
                if let Some(tag) = &tag {
                    session = session.with_routing_tag(tag.clone());
                }
                match app.route(&session).await {
                    Ok(route) => println!(
                        "{target}\t{}\t{}\t{}",
                        route.decision.mode,
                        route.decision.matched,
                        route.node()
                    ),
                    Err(e) => println!("{target}\terror\t{e:#}"),
                }
            }
        }
        Command::Watch => {
            let _watcher = RuleWatcher::spawn(Arc::clone(app.bypass()))?;
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
        }
    }

    app.shutdown();
    Ok(())
}
