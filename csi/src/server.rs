//! Vultr CSI plugin.
//!
//! Single binary serving the CSI Identity, Controller and Node gRPC
//! services over a unix domain socket. The role flag picks which planes
//! this process fulfills: the controller talks to the cloud inventory
//! API, the node to the local kernel.

extern crate clap;
#[macro_use]
extern crate tracing;

use std::{
    convert::TryFrom,
    fs,
    io::ErrorKind,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use clap::{App, Arg};
use futures::TryFutureExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UnixListener,
};
use tonic::transport::{server::Connected, Server};
use tracing_subscriber::filter::EnvFilter;

use csi::{
    cloud::rest::RestClient,
    config::{self, Config},
    controller::Controller,
    csi::{
        controller_server::ControllerServer,
        identity_server::IdentityServer,
        node_server::NodeServer,
    },
    identity::Identity,
    instance::{self, InstanceInfo},
    node::Node,
};

#[derive(Clone, Debug)]
pub struct UdsConnectInfo {
    pub peer_addr: Option<Arc<tokio::net::unix::SocketAddr>>,
    pub peer_cred: Option<tokio::net::unix::UCred>,
}

#[derive(Debug)]
struct UnixStream(tokio::net::UnixStream);

impl Connected for UnixStream {
    type ConnectInfo = UdsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        UdsConnectInfo {
            peer_addr: self.0.peer_addr().ok().map(Arc::new),
            peer_cred: self.0.peer_cred().ok(),
        }
    }
}

impl AsyncRead for UnixStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let matches = App::new("Vultr CSI plugin")
        .about("CSI driver for Vultr block storage and file system volumes")
        .arg(
            Arg::with_name(config::SOCKET_ARG)
                .short("c")
                .long(config::SOCKET_ARG)
                .value_name("PATH")
                .help("CSI gRPC listen socket (default /var/tmp/csi.sock)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(config::ROLE_ARG)
                .short("r")
                .long(config::ROLE_ARG)
                .value_name("ROLE")
                .possible_values(&["controller", "node", "both"])
                .help("Which CSI services this process serves")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(config::TOKEN_ARG)
                .short("t")
                .long(config::TOKEN_ARG)
                .value_name("TOKEN")
                .help("Cloud API token (alternatively VULTR_API_TOKEN)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(config::ENDPOINT_ARG)
                .long(config::ENDPOINT_ARG)
                .value_name("URL")
                .help("Cloud API endpoint")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(config::METADATA_ARG)
                .long(config::METADATA_ARG)
                .value_name("URL")
                .help("Instance metadata endpoint")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(config::NODE_ID_ARG)
                .long(config::NODE_ID_ARG)
                .value_name("ID")
                .help("Override the instance id reported by the metadata service")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(config::REGION_ARG)
                .long(config::REGION_ARG)
                .value_name("REGION")
                .help("Override the region reported by the metadata service")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the verbosity level"),
        )
        .get_matches();

    let level = match matches.occurrences_of("v") as usize {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // configure logger: env var takes precedence over cmd line options
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("csi={}", level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::try_from(&matches)?;

    // Remove stale CSI socket from previous instance if there is any
    match fs::remove_file(&config.csi_socket) {
        Ok(_) => info!("Removed stale CSI socket {}", config.csi_socket),
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                return Err(format!(
                    "Error removing stale CSI socket {}: {}",
                    config.csi_socket, err
                ));
            }
        }
    }

    CsiServer::run(config).await
}

struct CsiServer {}

impl CsiServer {
    pub async fn run(config: Config) -> Result<(), String> {
        let incoming = {
            let uds = UnixListener::bind(&config.csi_socket)
                .map_err(|error| {
                    format!(
                        "Failed to bind {}: {}",
                        config.csi_socket, error
                    )
                })?;
            info!("CSI plugin bound to {}", config.csi_socket);

            async_stream::stream! {
                while let item = uds.accept().map_ok(|(st, _)| UnixStream(st)).await {
                    yield item;
                }
            }
        };

        let controller = if config.role.controller() {
            let token = config
                .api_token
                .as_deref()
                .expect("role validation enforces a token");
            let client = RestClient::new(&config.api_endpoint, token)
                .map_err(|error| {
                    format!("Failed to set up the cloud client: {}", error)
                })?;
            info!("Controller role active against {}", config.api_endpoint);
            Some(ControllerServer::new(Controller::new(Arc::new(client))))
        } else {
            None
        };

        let node = if config.role.node() {
            let info = match (&config.node_id, &config.region) {
                (Some(id), Some(region)) => InstanceInfo {
                    id: id.clone(),
                    region: region.clone(),
                },
                _ => instance::probe(&config.metadata_endpoint)
                    .await
                    .map_err(|error| {
                        format!("Failed to read instance metadata: {}", error)
                    })?,
            };
            info!(
                "Node role active as instance {} in {}",
                info.id, info.region
            );
            Some(NodeServer::new(Node::new(info.id, info.region)))
        } else {
            None
        };

        if let Err(e) = Server::builder()
            .add_service(IdentityServer::new(Identity::default()))
            .add_optional_service(controller)
            .add_optional_service(node)
            .serve_with_incoming_shutdown(incoming, shutdown())
            .await
        {
            return Err(format!("CSI server failed with error: {}", e));
        }

        Ok(())
    }
}

async fn shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {}", error);
    }
    info!("Shutting down");
}
