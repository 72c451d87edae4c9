//! Cluster Certificate Rotation
//!
//! Replaces the cluster keypair on every member. The fan-out runs with the
//! All policy before anything is written locally, so a single offline member
//! aborts the rotation with no change anywhere. A failure in the middle of
//! the fan-out is not rolled back; the operator re-issues the rotation once
//! every member is reachable again.

use std::sync::Arc;

use crate::error::Result;
use crate::notify::{Notifier, NotifyHook, NotifyPolicy};
use crate::transport::CertificateUpdate;
use crate::trust::validate_keypair;

use super::MembershipCoordinator;

impl MembershipCoordinator {
    /// `PUT /cluster/certificate`
    ///
    /// `is_notification` is true when the request is the fan-out leg from
    /// another member, in which case only the local install happens.
    pub async fn rotate_certificate(
        &self,
        cert_pem: &str,
        key_pem: &str,
        is_notification: bool,
    ) -> Result<()> {
        validate_keypair(cert_pem, key_pem)?;

        let db = self.db().await;
        if db.is_clustered().await? && !is_notification {
            let local = self.local_address().await;
            let notifier = Notifier::new(
                &db,
                Arc::clone(self.transport()),
                &local,
                NotifyPolicy::All,
            )
            .await?;

            let update = Arc::new(CertificateUpdate {
                certificate: cert_pem.to_string(),
                key: key_pem.to_string(),
            });
            let hook: NotifyHook = Arc::new(move |client| {
                let update = Arc::clone(&update);
                Box::pin(async move { client.update_certificate(&update).await })
            });

            tracing::info!(
                peers = notifier.peer_count(),
                "distributing new cluster certificate"
            );
            notifier.notify(hook).await?;
        }

        // Local install: atomic file replacement, then the new snapshot is
        // published to TLS endpoints and the raft transport.
        self.trust().write_cluster_keypair(cert_pem, key_pem).await?;
        tracing::info!("cluster certificate updated");
        Ok(())
    }
}
