/*! Integration tests for livetree.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - driver: Tests for the StorageDriver trait across backends
 * - client: End-to-end tests for the optimistic mutation engine
 * - serialize: Scenario tests for tree-to-JSON projection
 * - props: Property tests for ordering, projection, and driver consistency
 */

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("livetree=info".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

mod driver;
mod helpers;
mod props;
mod serialize;
