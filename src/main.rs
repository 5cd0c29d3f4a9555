use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use smart_router::config::{Dispatcher, Settings, load_config, parse_server_list};
use smart_router::context::RouterContext;
use smart_router::dns_query::CombinedDnsQuery;
use smart_router::dns_server::DnsServer;
use smart_router::pipe_socks::{PipeSettings, PipeSocks};
use smart_router::querier::https::HttpsQuerier;
use smart_router::querier::remote::{ReqwestDispatcher, RemoteQuerier};
use smart_router::querier::tcp::TcpQuerier;
use smart_router::querier::udp::UdpQuerier;
use smart_router::querier::{DnsQuerier, Disabled, Queriers, system_dns_servers};
use smart_router::watcher;

/// 记录文件刷新间隔（存储内部另有10秒去抖）
const SAVE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Smart DNS resolver and relay for a routing proxy", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/router.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let settings = load_config(&args.config).context("load initial config")?;
    let ctx = RouterContext::with_defaults(settings);
    let queriers = build_queriers(&ctx.settings).context("build dns transports")?;
    let engine = Arc::new(CombinedDnsQuery::from_context(&ctx, queriers));

    if let Some(rules) = ctx.settings.rules_file.clone() {
        watcher::spawn(rules, ctx.lists.clone());
    }

    let mut server = DnsServer::bind(&ctx.settings, engine.clone())
        .await
        .context("bind dns server")?;
    server.start();

    let pipe = PipeSocks::start(PipeSettings::from_settings(&ctx.settings), ctx.lists.clone())
        .context("start pipe dispatcher")?;

    let mut flush = tokio::time::interval(SAVE_INTERVAL);
    flush.tick().await;
    loop {
        tokio::select! {
            _ = flush.tick() => ctx.save(false),
            res = tokio::signal::ctrl_c() => {
                if let Err(err) = res {
                    warn!(error = %err, "listen for shutdown signal failed");
                }
                break;
            }
        }
    }

    info!("shutting down");
    server.stop();
    pipe.stop();
    ctx.save(true);
    Ok(())
}

fn build_queriers(settings: &Settings) -> anyhow::Result<Queriers> {
    let local_servers = if settings.local_dns_servers.is_empty() {
        system_dns_servers(Path::new("/etc/resolv.conf"))
    } else {
        parse_server_list(&settings.local_dns_servers, 53)?
    };
    if local_servers.is_empty() {
        warn!("no local dns server found, local resolution disabled");
    }
    let local: Arc<dyn DnsQuerier> = Arc::new(UdpQuerier::bind(local_servers, settings.udp_timeout())?);

    let tcp: Arc<dyn DnsQuerier> = Arc::new(TcpQuerier::plain(settings.public_tcp_servers()?, settings.tcp_timeout()));
    let tls: Arc<dyn DnsQuerier> = Arc::new(TcpQuerier::tls(
        settings.dot_server_addrs()?,
        settings.tcp_timeout(),
        settings.dot_ca_file.as_deref(),
    )?);
    let https: Arc<dyn DnsQuerier> = Arc::new(HttpsQuerier::new(
        settings.doh_endpoints.clone(),
        settings.doh_mode,
        settings.https_timeout(),
        settings.upstream_proxy.as_deref(),
    )?);

    // 远程解析器只经由隧道前端访问
    let remote: Arc<dyn DnsQuerier> = match settings.dispatcher {
        Dispatcher::XTunnel if !settings.remote_resolver_hosts.is_empty() => {
            let dispatcher = Arc::new(ReqwestDispatcher::new(settings.remote_timeout())?);
            Arc::new(RemoteQuerier::new(
                settings.remote_resolver_hosts.clone(),
                dispatcher,
                settings.remote_timeout(),
            ))
        }
        _ => Arc::new(Disabled::new("remote")),
    };

    Ok(Queriers {
        local,
        tcp,
        tls,
        https,
        remote,
    })
}

fn init_tracing(debug: bool) {
    // 非 debug 仅输出 warn 以上
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
