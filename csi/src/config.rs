//! Runtime configuration assembled from the command line.

use std::{convert::TryFrom, str::FromStr};

use clap::ArgMatches;

use crate::instance;

pub const ROLE_ARG: &str = "role";
pub const SOCKET_ARG: &str = "csi-socket";
pub const TOKEN_ARG: &str = "api-token";
pub const ENDPOINT_ARG: &str = "api-endpoint";
pub const METADATA_ARG: &str = "metadata-endpoint";
pub const NODE_ID_ARG: &str = "node-id";
pub const REGION_ARG: &str = "region";

pub const DEFAULT_CSI_SOCKET: &str = "/var/tmp/csi.sock";
pub const DEFAULT_API_ENDPOINT: &str = "https://api.vultr.com/v2";

/// Environment variable consulted when --api-token is not given.
pub const TOKEN_ENV: &str = "VULTR_API_TOKEN";

/// Deployment role of this process: which CSI services it serves. A
/// single binary fulfills both planes, distinguished at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsiRole {
    Controller,
    Node,
    Both,
}

impl CsiRole {
    pub fn controller(&self) -> bool {
        matches!(self, CsiRole::Controller | CsiRole::Both)
    }

    pub fn node(&self) -> bool {
        matches!(self, CsiRole::Node | CsiRole::Both)
    }
}

impl FromStr for CsiRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "controller" => Ok(CsiRole::Controller),
            "node" => Ok(CsiRole::Node),
            "both" => Ok(CsiRole::Both),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub role: CsiRole,
    pub csi_socket: String,
    pub api_endpoint: String,
    pub api_token: Option<String>,
    pub metadata_endpoint: String,
    /// Overrides for the instance metadata probe, mostly for running
    /// outside a cloud instance.
    pub node_id: Option<String>,
    pub region: Option<String>,
}

impl TryFrom<&ArgMatches<'_>> for Config {
    type Error = String;

    fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
        let role: CsiRole =
            matches.value_of(ROLE_ARG).unwrap_or("both").parse()?;

        let api_token = matches
            .value_of(TOKEN_ARG)
            .map(str::to_string)
            .or_else(|| std::env::var(TOKEN_ENV).ok());

        if role.controller() && api_token.is_none() {
            return Err(format!(
                "--{} (or {}) is required for the controller role",
                TOKEN_ARG, TOKEN_ENV
            ));
        }

        Ok(Config {
            role,
            csi_socket: matches
                .value_of(SOCKET_ARG)
                .unwrap_or(DEFAULT_CSI_SOCKET)
                .to_string(),
            api_endpoint: matches
                .value_of(ENDPOINT_ARG)
                .unwrap_or(DEFAULT_API_ENDPOINT)
                .to_string(),
            api_token,
            metadata_endpoint: matches
                .value_of(METADATA_ARG)
                .unwrap_or(instance::METADATA_ENDPOINT)
                .to_string(),
            node_id: matches.value_of(NODE_ID_ARG).map(str::to_string),
            region: matches.value_of(REGION_ARG).map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{App, Arg};

    fn matches(args: &[&str]) -> clap::ArgMatches<'static> {
        App::new("test")
            .arg(Arg::with_name(ROLE_ARG).long(ROLE_ARG).takes_value(true))
            .arg(
                Arg::with_name(SOCKET_ARG)
                    .long(SOCKET_ARG)
                    .takes_value(true),
            )
            .arg(
                Arg::with_name(TOKEN_ARG).long(TOKEN_ARG).takes_value(true),
            )
            .arg(
                Arg::with_name(ENDPOINT_ARG)
                    .long(ENDPOINT_ARG)
                    .takes_value(true),
            )
            .arg(
                Arg::with_name(METADATA_ARG)
                    .long(METADATA_ARG)
                    .takes_value(true),
            )
            .arg(
                Arg::with_name(NODE_ID_ARG)
                    .long(NODE_ID_ARG)
                    .takes_value(true),
            )
            .arg(
                Arg::with_name(REGION_ARG)
                    .long(REGION_ARG)
                    .takes_value(true),
            )
            .get_matches_from(
                std::iter::once("test").chain(args.iter().copied()),
            )
    }

    #[test]
    fn roles_parse() {
        assert_eq!("controller".parse(), Ok(CsiRole::Controller));
        assert_eq!("node".parse(), Ok(CsiRole::Node));
        assert_eq!("both".parse(), Ok(CsiRole::Both));
        assert!("sidecar".parse::<CsiRole>().is_err());

        assert!(CsiRole::Both.controller());
        assert!(CsiRole::Both.node());
        assert!(!CsiRole::Node.controller());
    }

    #[test]
    fn node_role_needs_no_token() {
        let config =
            Config::try_from(&matches(&["--role", "node"])).unwrap();
        assert_eq!(config.role, CsiRole::Node);
        assert_eq!(config.csi_socket, DEFAULT_CSI_SOCKET);
    }

    #[test]
    fn controller_role_requires_a_token() {
        assert!(Config::try_from(&matches(&["--role", "controller"]))
            .is_err());

        let config = Config::try_from(&matches(&[
            "--role",
            "controller",
            "--api-token",
            "secret",
        ]))
        .unwrap();
        assert_eq!(config.api_token.as_deref(), Some("secret"));
    }
}
