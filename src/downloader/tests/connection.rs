use super::*;
use crate::types::{ConnectionType, NetworkType};

#[tokio::test]
async fn restricting_to_unmetered_parks_batches_on_metered_network() {
    let network = FakeNetwork::with_chunk_delay(Duration::from_millis(5));
    network.serve("https://host/big.bin", vec![4u8; 2000]);
    let t = create_test_manager(network).await;
    t.connection.set_network(NetworkType::Metered);
    let mut events = t.manager.subscribe();
    let id = batch_id("b1");

    t.manager
        .submit(single_file_batch("b1", "https://host/big.bin"))
        .await
        .unwrap();
    while t.manager.batch_status(&id).await.unwrap().bytes_downloaded == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    t.manager
        .update_allowed_connection_type(ConnectionType::Unmetered)
        .await
        .unwrap();
    wait_for_status(&mut events, &id, Status::WaitingForNetwork).await;
    eventually(|| no_running_batches(&t.manager)).await;

    let written = bytes_on_disk(&t, "b1", "big.bin");
    assert!(written > 0 && written < 2000);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(bytes_on_disk(&t, "b1", "big.bin"), written, "no bytes while parked");
    assert_eq!(t.network.stream_offsets("https://host/big.bin").len(), 1);
    assert!(
        t.manager
            .file_statuses(&id)
            .await
            .unwrap()
            .iter()
            .all(|f| f.status == FileStatus::WaitingForNetwork)
    );

    t.manager
        .network_changed(NetworkType::Unmetered)
        .await
        .unwrap();
    wait_for_status(&mut events, &id, Status::Downloaded).await;
    assert_eq!(
        t.network.stream_offsets("https://host/big.bin"),
        vec![0, written as i64]
    );
}

#[tokio::test]
async fn batch_submitted_offline_waits_for_network() {
    let network = FakeNetwork::new();
    network.serve("https://host/one.bin", vec![1u8; 50]);
    let t = create_test_manager(network).await;
    t.connection.set_network(NetworkType::None);
    let mut events = t.manager.subscribe();
    let id = batch_id("b1");

    t.manager
        .submit(single_file_batch("b1", "https://host/one.bin"))
        .await
        .unwrap();
    wait_for_status(&mut events, &id, Status::WaitingForNetwork).await;
    assert_eq!(t.network.size_requests(), 0);
    eventually(|| t.manager.recovery.has_pending()).await;

    t.manager
        .network_changed(NetworkType::Metered)
        .await
        .unwrap();
    wait_for_status(&mut events, &id, Status::Downloaded).await;
    assert_eq!(bytes_on_disk(&t, "b1", "one.bin"), 50);
}

#[tokio::test]
async fn widening_policy_resumes_waiting_batches() {
    let network = FakeNetwork::new();
    network.serve("https://host/one.bin", vec![1u8; 50]);
    let t = create_test_manager(network).await;
    t.manager
        .update_allowed_connection_type(ConnectionType::Unmetered)
        .await
        .unwrap();
    t.connection.set_network(NetworkType::Metered);
    let mut events = t.manager.subscribe();
    let id = batch_id("b1");

    t.manager
        .submit(single_file_batch("b1", "https://host/one.bin"))
        .await
        .unwrap();
    wait_for_status(&mut events, &id, Status::WaitingForNetwork).await;

    t.manager
        .update_allowed_connection_type(ConnectionType::All)
        .await
        .unwrap();
    wait_for_status(&mut events, &id, Status::Downloaded).await;
    assert_eq!(t.connection.allowed_connection_type(), ConnectionType::All);
}
