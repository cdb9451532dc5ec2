// tests/property/tier_test.rs

use crate::common::{MockFactory, MockTokenSender, device_credential, small_pool_config};
use hubmux::config::TransportConfig;
use hubmux::connection::LoadTier;
use hubmux::core::credential::AccessRights;
use hubmux::{ConnectionCache, HubMuxError, PooledConnection};
use proptest::prelude::*;
use std::time::Duration;

fn expected_tier(count: usize, lightly_ceiling: usize, semi_ceiling: usize) -> LoadTier {
    if count < lightly_ceiling {
        LoadTier::Lightly
    } else if count < semi_ceiling {
        LoadTier::Semi
    } else {
        LoadTier::Fully
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Under any interleaving of admissions and releases, every pooled
    /// connection sits in the tier matching its device count, the device
    /// slots add up, and the pool never exceeds its configured size.
    #[test]
    fn test_tier_membership_matches_occupancy(
        lightly_ceiling in 1usize..6,
        semi_extra in 0usize..6,
        device_headroom in 0usize..6,
        max_pools in 1usize..4,
        ops in proptest::collection::vec(any::<bool>(), 1..80),
    ) {
        let semi_ceiling = lightly_ceiling + semi_extra;
        let max_devices = semi_ceiling + device_headroom + 1;
        let config = small_pool_config(
            Duration::from_secs(300),
            max_pools,
            max_devices,
            lightly_ceiling,
            semi_ceiling,
        );

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let cache = ConnectionCache::new(MockFactory::new(), MockTokenSender::new(), config);
            let transport = TransportConfig::default();
            let probe = device_credential("contoso.example.net", "probe");
            let mut leases: Vec<PooledConnection> = Vec::new();

            for (step, acquire) in ops.into_iter().enumerate() {
                if acquire {
                    match cache.acquire_connection(
                        &device_credential("contoso.example.net", &format!("d{step}")),
                        AccessRights::DEVICE_CONNECT,
                        &transport,
                    ) {
                        Ok(lease) => leases.push(lease),
                        Err(HubMuxError::CapacityExhausted(_)) => {
                            // Exhaustion is only legal with every connection
                            // present and saturated.
                            let pool = cache.device_pool(&probe).unwrap();
                            prop_assert_eq!(pool.connection_count(), max_pools);
                            for (_, count, _) in pool.snapshot() {
                                prop_assert_eq!(count, max_devices);
                            }
                        }
                        Err(err) => return Err(TestCaseError::fail(format!("{err:?}"))),
                    }
                } else if !leases.is_empty() {
                    let index = step % leases.len();
                    leases.swap_remove(index);
                }

                let Some(pool) = cache.device_pool(&probe) else {
                    prop_assert!(leases.is_empty());
                    continue;
                };
                let snapshot = pool.snapshot();
                prop_assert!(snapshot.len() <= max_pools);
                let mut total_devices = 0;
                for (id, count, tier) in snapshot {
                    prop_assert!(count <= max_devices, "connection {} over cap", id);
                    prop_assert_eq!(
                        tier,
                        expected_tier(count, lightly_ceiling, semi_ceiling),
                        "connection {} with {} devices in the wrong tier",
                        id,
                        count
                    );
                    total_devices += count;
                }
                prop_assert_eq!(total_devices, leases.len());
            }
            Ok(())
        })?;
    }
}
