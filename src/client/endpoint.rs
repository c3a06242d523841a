//! Redirect-following client endpoint.

use std::net::SocketAddr;

use crate::utils::ViewstampError;
use crate::server::{
    ReplicaId, ClusterMap, Command, CommandResult, RequestNum, ApiRequest,
    ApiReply, ApiError,
};
use crate::client::{ClientId, ClientApiStub};

use serde::Deserialize;

use tokio::time::{self, Duration};

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    /// Which server to pick initially.
    pub init_server_id: ReplicaId,

    /// Give up on one reply after this long and resend.
    pub reply_timeout_ms: u64,

    /// Pause before resending after a view change hint or failure.
    pub retry_interval_ms: u64,

    /// Total sends of one request before giving up.
    pub max_attempts: u32,
}

#[allow(clippy::derivable_impls)]
impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            init_server_id: 0,
            reply_timeout_ms: 3000,
            retry_interval_ms: 200,
            max_attempts: 30,
        }
    }
}

/// Client endpoint that talks to the current primary, follows redirects, and
/// resends under the same request number until it gets a result.
pub struct ClientEndpoint {
    /// My client ID.
    id: ClientId,

    /// Configuration parameters struct.
    config: ClientConfig,

    /// API addresses of servers, indexed by replica ID.
    servers: Vec<SocketAddr>,

    /// Current server ID to talk to.
    server_id: ReplicaId,

    /// Highest view heard of in replies.
    view: u64,

    /// Request number of the next new request.
    next_req: RequestNum,

    /// Connection to the current server, if established.
    stub: Option<ClientApiStub>,
}

impl ClientEndpoint {
    /// Creates a client endpoint for the given cluster. Connection happens
    /// lazily on the first request.
    pub fn new_and_setup(
        id: ClientId,
        cluster: &ClusterMap,
        config_str: Option<&str>,
    ) -> Result<Self, ViewstampError> {
        let config = parsed_config!(config_str => ClientConfig;
                                    init_server_id, reply_timeout_ms,
                                    retry_interval_ms, max_attempts)?;
        if config.init_server_id >= cluster.population() {
            return logged_err!(id; "invalid init_server_id {}",
                                   config.init_server_id);
        }
        if config.max_attempts == 0 || config.reply_timeout_ms == 0 {
            return logged_err!(id; "invalid client config {:?}", config);
        }

        let servers = cluster.replicas().iter().map(|spec| spec.api_addr).collect();
        Ok(ClientEndpoint {
            id,
            server_id: config.init_server_id,
            config,
            servers,
            view: 0,
            next_req: 1,
            stub: None,
        })
    }

    #[inline]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Server currently believed to be the primary.
    #[inline]
    pub fn server_id(&self) -> ReplicaId {
        self.server_id
    }

    #[inline]
    pub fn next_req_num(&self) -> RequestNum {
        self.next_req
    }

    #[inline]
    fn population(&self) -> u8 {
        self.servers.len() as u8
    }

    /// Executes a command through the service, returning its result.
    pub async fn execute(
        &mut self,
        cmd: Command,
    ) -> Result<CommandResult, ViewstampError> {
        let req_num = self.next_req;
        let retry_interval = Duration::from_millis(self.config.retry_interval_ms);

        for attempt in 1..=self.config.max_attempts {
            match self.send_and_wait(req_num, &cmd).await {
                Ok(ApiReply::Reply {
                    view,
                    req_num: reply_num,
                    result,
                    error,
                }) => {
                    if reply_num != req_num {
                        pf_warn!(self.id; "reply for #{} while waiting for #{}",
                                          reply_num, req_num);
                        continue;
                    }
                    match (result, error) {
                        (Some(result), _) => {
                            self.next_req += 1;
                            return Ok(result);
                        }
                        (None, Some(ApiError::NotPrimary)) => {
                            self.view = self.view.max(view);
                            let primary = (self.view % self.population() as u64) as ReplicaId;
                            if primary == self.server_id {
                                self.switch_server((primary + 1) % self.population());
                            } else {
                                self.switch_server(primary);
                            }
                        }
                        (None, hint) => {
                            // view change in progress, or my own request
                            // still in flight there
                            pf_debug!(self.id; "attempt {} of #{}: {:?}", attempt, req_num, hint);
                            time::sleep(retry_interval).await;
                        }
                    }
                }
                Ok(ApiReply::Leave) => {
                    pf_warn!(self.id; "unexpected leave reply");
                }
                Err(e) => {
                    pf_warn!(self.id; "attempt {} of #{} via {} failed: {}",
                                      attempt, req_num, self.server_id, e);
                    self.switch_server((self.server_id + 1) % self.population());
                    time::sleep(retry_interval).await;
                }
            }
        }

        Err(ViewstampError::msg(format!(
            "request #{} gave up after {} attempts",
            req_num, self.config.max_attempts
        )))
    }

    /// Sends one request to the current server and waits for its reply.
    /// Drops the connection on any failure.
    async fn send_and_wait(
        &mut self,
        req_num: RequestNum,
        cmd: &Command,
    ) -> Result<ApiReply, ViewstampError> {
        if self.stub.is_none() {
            let addr = self.servers[self.server_id as usize];
            pf_debug!(self.id; "connecting to server {} '{}'", self.server_id, addr);
            self.stub = Some(ClientApiStub::connect(self.id, addr).await?);
        }
        let Some(stub) = self.stub.as_mut() else {
            return logged_err!(self.id; "no server connection");
        };

        let req = ApiRequest::Execute {
            req_num,
            cmd: cmd.clone(),
        };
        let reply_timeout = Duration::from_millis(self.config.reply_timeout_ms);
        let result = match stub.send_req(&req).await {
            Ok(()) => match time::timeout(reply_timeout, stub.recv_reply()).await {
                Ok(reply) => reply,
                Err(_) => Err(ViewstampError::msg("reply timed out")),
            },
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.stub = None;
        }
        result
    }

    fn switch_server(&mut self, server_id: ReplicaId) {
        if server_id != self.server_id {
            pf_debug!(self.id; "switching to server {}", server_id);
            self.server_id = server_id;
            self.stub = None;
        }
    }

    /// Leaves the current server connection, if any.
    pub async fn leave(&mut self) -> Result<(), ViewstampError> {
        if let Some(mut stub) = self.stub.take() {
            stub.send_req(&ApiRequest::Leave).await?;
            while stub.recv_reply().await? != ApiReply::Leave {}
            pf_debug!(self.id; "left server connection {}", self.server_id);
        }
        Ok(())
    }
}
