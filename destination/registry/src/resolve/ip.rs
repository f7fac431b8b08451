use linkerd_destination_core::{Destination, Done, Emitter, Endpoint, Resolve, Scheme};
use std::net::SocketAddr;

/// Resolves an IP address to itself.
///
/// This is the fallback for IP destinations that are not owned by any known
/// cluster resource.
#[derive(Clone, Debug, Default)]
pub struct LiteralIp(());

#[async_trait::async_trait]
impl Resolve for LiteralIp {
    fn name(&self) -> &'static str {
        "ip"
    }

    fn can_resolve(&self, dst: &Destination) -> bool {
        dst.scheme == Scheme::Ip && dst.ip().is_some()
    }

    async fn stream_resolution(
        &self,
        dst: Destination,
        mut emit: Emitter,
        done: Done,
    ) -> anyhow::Result<()> {
        let ip = dst
            .ip()
            .ok_or_else(|| anyhow::anyhow!("{dst} is not an IP address"))?;
        emit.emit(Some(Endpoint::new(SocketAddr::new(ip, dst.port))));

        // Nothing changes until the watch is closed.
        let _release = done.signaled().await;
        Ok(())
    }
}
