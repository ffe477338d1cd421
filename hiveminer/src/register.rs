// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Address registration. The terms message is signed verbatim by each address
//! and posted once; re-registration is tolerated so a worker can run this on
//! every boot.

use hiveminer_logging::macros::*;

use crate::api;
use crate::error;
use crate::hal::{MineApi, Signer};

use std::sync::Arc;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegisterSummary {
    pub registered: usize,
    pub duplicates: usize,
    pub failed: usize,
}

pub struct Registrar {
    api: Arc<dyn MineApi>,
    signer: Arc<dyn Signer>,
}

impl Registrar {
    pub fn new(api: Arc<dyn MineApi>, signer: Arc<dyn Signer>) -> Self {
        Self { api, signer }
    }

    /// Register every address against one terms version. Failures of single
    /// addresses do not stop the batch; an unregistered address simply earns
    /// rejections later.
    pub async fn register_addresses(
        &self,
        terms_version: &str,
        addresses: &[String],
    ) -> error::Result<RegisterSummary> {
        let terms = self.api.terms(terms_version).await?;
        info!(
            "Register: signing terms {} for {} addresses",
            terms.version,
            addresses.len()
        );

        let mut summary = RegisterSummary::default();
        for address in addresses {
            let signature = match self.signer.sign(address, &terms.message).await {
                Ok(signature) => signature,
                Err(e) => {
                    warn!("Register: cannot sign for {}: {}", address, e);
                    summary.failed += 1;
                    continue;
                }
            };
            match self
                .api
                .register(address, &signature.signature, &signature.pubkey)
                .await
            {
                api::Register::Accepted(_) => summary.registered += 1,
                api::Register::Duplicate => summary.duplicates += 1,
                api::Register::Transient(message) | api::Register::Fatal(message) => {
                    warn!("Register: {} not registered: {}", address, message);
                    summary.failed += 1;
                }
            }
        }
        info!(
            "Register: {} new, {} already registered, {} failed",
            summary.registered, summary.duplicates, summary.failed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{FakeApi, FakeSigner};

    #[tokio::test]
    async fn test_batch_counts_outcomes() {
        let api = Arc::new(FakeApi::new());
        api.set_register_outcomes(vec![
            api::Register::Accepted(Default::default()),
            api::Register::Duplicate,
            api::Register::Fatal("bad signature".to_string()),
        ]);

        let registrar = Registrar::new(api.clone(), Arc::new(FakeSigner));
        let summary = registrar
            .register_addresses(
                "1",
                &["a".to_string(), "b".to_string(), "c".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(
            summary,
            RegisterSummary {
                registered: 1,
                duplicates: 1,
                failed: 1,
            }
        );
        // every signature covered the verbatim terms message
        assert!(api
            .registrations()
            .iter()
            .all(|(_, signature, _)| signature.starts_with("signed:")));
    }
}
