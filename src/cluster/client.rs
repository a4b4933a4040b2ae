//! Default token client: the semantic layer over a pluggable transport.

use crate::cluster::{
    ClusterTokenClient, TokenResult, TokenService, TokenServiceError,
};
use crate::value::ParamValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenRequestKind {
    Flow,
    Param,
}

/// Wire shape of one token request. Framing, codec and reconnection are
/// the transport's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub kind: TokenRequestKind,
    pub flow_id: u64,
    pub count: u32,
    pub prioritized: bool,
    #[serde(default)]
    pub params: Vec<ParamValue>,
}

/// One round-trip to the token server. Implementations must complete or
/// fail before returning; the caller blocks on it.
pub trait TokenTransport: Send + Sync {
    fn exchange(&self, request: &TokenRequest) -> Result<TokenResult, TokenServiceError>;

    fn open(&self) -> Result<(), TokenServiceError> {
        Ok(())
    }

    fn close(&self) -> Result<(), TokenServiceError> {
        Ok(())
    }
}

/// Token client over any [`TokenTransport`].
pub struct DefaultClusterTokenClient {
    transport: Arc<dyn TokenTransport>,
}

impl DefaultClusterTokenClient {
    pub fn new(transport: Arc<dyn TokenTransport>) -> Self {
        Self { transport }
    }
}

impl TokenService for DefaultClusterTokenClient {
    fn request_token(
        &self,
        flow_id: u64,
        count: u32,
        prioritized: bool,
    ) -> Result<TokenResult, TokenServiceError> {
        self.transport.exchange(&TokenRequest {
            kind: TokenRequestKind::Flow,
            flow_id,
            count,
            prioritized,
            params: Vec::new(),
        })
    }

    fn request_param_token(
        &self,
        flow_id: u64,
        count: u32,
        params: &[ParamValue],
    ) -> Result<TokenResult, TokenServiceError> {
        self.transport.exchange(&TokenRequest {
            kind: TokenRequestKind::Param,
            flow_id,
            count,
            prioritized: false,
            params: params.to_vec(),
        })
    }
}

impl ClusterTokenClient for DefaultClusterTokenClient {
    fn start(&self) -> Result<(), TokenServiceError> {
        self.transport.open()?;
        log::info!("cluster token client started");
        Ok(())
    }

    fn stop(&self) -> Result<(), TokenServiceError> {
        self.transport.close()?;
        log::info!("cluster token client stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::TokenStatus;

    struct EchoTransport;

    impl TokenTransport for EchoTransport {
        fn exchange(&self, request: &TokenRequest) -> Result<TokenResult, TokenServiceError> {
            match request.kind {
                TokenRequestKind::Flow => Ok(TokenResult::ok(request.count as i64)),
                TokenRequestKind::Param => Ok(TokenResult::blocked()),
            }
        }
    }

    #[test]
    fn requests_carry_their_kind() {
        let client = DefaultClusterTokenClient::new(Arc::new(EchoTransport));
        let flow = client.request_token(7, 3, false).unwrap();
        assert_eq!(flow.status, TokenStatus::Ok);
        assert_eq!(flow.remaining, 3);

        let param = client
            .request_param_token(7, 1, &[ParamValue::from("k")])
            .unwrap();
        assert_eq!(param.status, TokenStatus::Blocked);
    }

    #[test]
    fn requests_round_trip_as_json() {
        let request = TokenRequest {
            kind: TokenRequestKind::Flow,
            flow_id: 42,
            count: 2,
            prioritized: true,
            params: Vec::new(),
        };
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: TokenRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(request, decoded);
    }
}
