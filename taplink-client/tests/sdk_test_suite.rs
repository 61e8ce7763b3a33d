//! End-to-end scenarios against the emulated terminal.

use std::{sync::Arc, time::Duration};

use taplink_client::ConnectionConfig;
use taplink_test_utils::{EmulatedTerminal, TerminalBehavior, TransactionScript};
use taplink_types::action::Action;

use crate::setup::{
    ConnEvent, TxEvent, build_sdk, build_sdk_with_store, next_event, recording_callback,
    recording_listener, sale_request, ScriptedBrowser,
};

mod setup;

const EVENT_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn happy_connect_reports_waiting_then_connected() -> eyre::Result<()> {
    let terminal = EmulatedTerminal::spawn_default().await?;
    let harness = build_sdk();
    let (listener, mut events) = recording_listener();

    harness
        .sdk
        .connect(
            Some(ConnectionConfig::lan(terminal.host(), terminal.port(), false)),
            listener,
        )
        .await
        .expect("connect succeeds");

    assert_eq!(next_event(&mut events, EVENT_DEADLINE).await, ConnEvent::Waiting);
    assert_eq!(
        next_event(&mut events, EVENT_DEADLINE).await,
        ConnEvent::Connected("D-7".to_string(), "2.4.1".to_string())
    );
    assert!(harness.sdk.is_connected());
    let device = harness.sdk.device_info().expect("device info cached");
    assert_eq!(device.device_id.as_str(), "D-7");

    // the successful endpoint is persisted and auto-connect is armed
    use taplink_client::store::PreferenceStore as _;
    assert_eq!(
        harness.store.get("connected_device_id").as_deref(),
        Some("D-7")
    );
    assert_eq!(
        harness.store.get("auto_connect_enabled").as_deref(),
        Some("true")
    );
    Ok(())
}

#[tokio::test]
async fn duplicate_connect_queues_the_second_listener() -> eyre::Result<()> {
    let terminal = EmulatedTerminal::spawn(TerminalBehavior {
        init_delay: Duration::from_millis(300),
        ..TerminalBehavior::default()
    })
    .await?;
    let harness = build_sdk();
    let config = ConnectionConfig::lan(terminal.host(), terminal.port(), false);

    let (first, mut first_events) = recording_listener();
    let first_connect = tokio::spawn({
        let sdk = harness.sdk.clone();
        let config = config.clone();
        async move { sdk.connect(Some(config), first).await }
    });

    // wait until the first attempt is visibly in flight
    let in_flight = async {
        loop {
            let status = harness.sdk.connection().status();
            if status == taplink_client::ConnectionStatus::Connecting
                || status == taplink_client::ConnectionStatus::WaitConnecting
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(EVENT_DEADLINE, in_flight).await?;

    let (second, mut second_events) = recording_listener();
    harness
        .sdk
        .connect(Some(config), second)
        .await
        .expect("second connect queues");

    first_connect.await?.expect("first connect succeeds");

    assert_eq!(next_event(&mut first_events, EVENT_DEADLINE).await, ConnEvent::Waiting);
    assert_eq!(
        next_event(&mut first_events, EVENT_DEADLINE).await,
        ConnEvent::Connected("D-7".to_string(), "2.4.1".to_string())
    );
    assert_eq!(
        next_event(&mut second_events, EVENT_DEADLINE).await,
        ConnEvent::Connected("D-7".to_string(), "2.4.1".to_string())
    );
    // exactly once each
    assert!(first_events.try_recv().is_err());
    assert!(second_events.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn init_failure_forces_disconnect_and_drains_registry() -> eyre::Result<()> {
    let terminal = EmulatedTerminal::spawn(TerminalBehavior {
        init_code: "203".to_string(),
        ..TerminalBehavior::default()
    })
    .await?;
    let harness = build_sdk();
    let (listener, mut events) = recording_listener();

    let result = harness
        .sdk
        .connect(
            Some(ConnectionConfig::lan(terminal.host(), terminal.port(), false)),
            listener,
        )
        .await;

    let err = result.expect_err("INIT rejection fails the attempt");
    assert_eq!(err.code, "203");
    assert_eq!(next_event(&mut events, EVENT_DEADLINE).await, ConnEvent::Waiting);
    assert_eq!(
        next_event(&mut events, EVENT_DEADLINE).await,
        ConnEvent::Error("203".to_string())
    );
    assert!(!harness.sdk.is_connected());
    assert_eq!(harness.sdk.connection().outstanding_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn discovery_fallback_reaches_the_advertised_endpoint() -> eyre::Result<()> {
    let terminal = EmulatedTerminal::spawn_default().await?;
    let store = Arc::new(taplink_client::store::MemoryPreferenceStore::new());
    // the SDK has seen this terminal before
    taplink_client::store::PreferenceStore::put(
        store.as_ref(),
        "connected_device_id",
        "D-7".to_string(),
    );
    let harness = build_sdk_with_store(store);
    harness.browser.announce(ScriptedBrowser::service(
        "TaproService_D-7",
        "127.0.0.1",
        terminal.port(),
    ));
    let (listener, mut events) = recording_listener();

    // port 9 answers nothing; the direct dial fails and discovery takes over
    harness
        .sdk
        .connect(
            Some(ConnectionConfig::lan("127.0.0.1", 9, false)),
            listener,
        )
        .await
        .expect("fallback connect succeeds");

    assert_eq!(next_event(&mut events, EVENT_DEADLINE).await, ConnEvent::Waiting);
    assert_eq!(
        next_event(&mut events, EVENT_DEADLINE).await,
        ConnEvent::Connected("D-7".to_string(), "2.4.1".to_string())
    );
    assert!(harness.sdk.is_connected());
    Ok(())
}

#[tokio::test]
async fn discovery_budget_is_bounded_at_four_rounds() -> eyre::Result<()> {
    let harness = build_sdk();
    let (listener, mut events) = recording_listener();

    let err = harness
        .sdk
        .connect(
            Some(ConnectionConfig::lan("127.0.0.1", 9, false)),
            listener,
        )
        .await
        .expect_err("nothing to discover");
    assert_eq!(err.code, "242");
    assert_eq!(next_event(&mut events, EVENT_DEADLINE).await, ConnEvent::Waiting);
    assert_eq!(
        next_event(&mut events, EVENT_DEADLINE).await,
        ConnEvent::Error("242".to_string())
    );
    // initial round plus three retries, never more
    assert_eq!(harness.browser.browse_count(), 4);
    Ok(())
}

#[tokio::test]
async fn heartbeat_death_keeps_monitoring_and_rediscovery_reconnects() -> eyre::Result<()> {
    let terminal = EmulatedTerminal::spawn_default().await?;
    let harness = build_sdk();
    let (listener, mut events) = recording_listener();
    let (global, mut global_events) = recording_listener();
    harness.sdk.connection().set_connection_listener(global);

    harness
        .sdk
        .connect(
            Some(ConnectionConfig::lan(terminal.host(), terminal.port(), false)),
            listener,
        )
        .await
        .expect("connect succeeds");
    while next_event(&mut events, EVENT_DEADLINE).await
        != ConnEvent::Connected("D-7".to_string(), "2.4.1".to_string())
    {}

    // two consecutive heartbeat timeouts declare the connection dead
    terminal.set_echo_heartbeats(false);
    loop {
        if let ConnEvent::Error(code) = next_event(&mut global_events, EVENT_DEADLINE).await {
            assert_eq!(code, "213");
            break;
        }
    }
    assert!(!harness.sdk.is_connected());
    // the socket is gone but mDNS monitoring survives
    assert!(harness.sdk.connection().is_lan_monitoring());

    // the device comes back; two advertisements inside the debounce window
    // still cause exactly one reconnect
    terminal.set_echo_heartbeats(true);
    harness.browser.announce(ScriptedBrowser::service(
        "TaproService_D-7",
        "127.0.0.1",
        terminal.port(),
    ));
    harness.browser.announce(ScriptedBrowser::service(
        "TaproService_D-7",
        "10.9.9.9",
        4242,
    ));

    loop {
        if let ConnEvent::Connected(device, _) =
            next_event(&mut global_events, EVENT_DEADLINE).await
        {
            assert_eq!(device, "D-7");
            break;
        }
    }
    assert!(harness.sdk.is_connected());
    let init_count = terminal
        .received()
        .iter()
        .filter(|envelope| envelope.action == Action::Init)
        .count();
    assert_eq!(init_count, 2, "initial connect plus exactly one reconnect");
    Ok(())
}

#[tokio::test]
async fn transaction_timeout_fires_response_timeout() -> eyre::Result<()> {
    let terminal = EmulatedTerminal::spawn(TerminalBehavior {
        script: TransactionScript::ProgressThenSilence {
            progress: vec![4000],
        },
        ..TerminalBehavior::default()
    })
    .await?;
    let harness = build_sdk();
    let (listener, _events) = recording_listener();
    harness
        .sdk
        .connect(
            Some(ConnectionConfig::lan(terminal.host(), terminal.port(), false)),
            listener,
        )
        .await
        .expect("connect succeeds");

    let (callback, mut tx_events) = recording_callback();
    let mut request = sale_request("O-000001", "8.99", "USD");
    request.request_timeout = Some(1);
    harness
        .sdk
        .payments()
        .sale(request, callback)
        .await
        .expect("sale admitted");

    assert!(matches!(
        next_event(&mut tx_events, EVENT_DEADLINE).await,
        TxEvent::Progress("PROCESSING")
    ));
    match next_event(&mut tx_events, EVENT_DEADLINE).await {
        TxEvent::Failure(error) => {
            assert_eq!(error.code, "306");
            assert!(error.needs_query_before_retry());
        }
        other => panic!("expected the timeout failure, got {other:?}"),
    }
    assert_eq!(harness.sdk.connection().outstanding_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn sale_streams_progress_to_completion() -> eyre::Result<()> {
    let terminal = EmulatedTerminal::spawn_default().await?;
    let harness = build_sdk();
    let (listener, _events) = recording_listener();
    harness
        .sdk
        .connect(
            Some(ConnectionConfig::lan(terminal.host(), terminal.port(), false)),
            listener,
        )
        .await
        .expect("connect succeeds");

    let (callback, mut tx_events) = recording_callback();
    let trace_id = harness
        .sdk
        .payments()
        .sale(sale_request("O-000042", "8.99", "USD"), callback)
        .await
        .expect("sale admitted");

    assert!(matches!(
        next_event(&mut tx_events, EVENT_DEADLINE).await,
        TxEvent::Progress("PROCESSING")
    ));
    assert!(matches!(
        next_event(&mut tx_events, EVENT_DEADLINE).await,
        TxEvent::Progress("WAITING_CARD")
    ));
    assert!(matches!(
        next_event(&mut tx_events, EVENT_DEADLINE).await,
        TxEvent::Progress("CARD_DETECTED")
    ));
    match next_event(&mut tx_events, EVENT_DEADLINE).await {
        TxEvent::Success(result) => {
            assert_eq!(result.trace_id.as_ref(), Some(&trace_id));
            assert!(result.transaction_id.is_some());
        }
        other => panic!("expected completion, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn passive_loss_auto_reconnects() -> eyre::Result<()> {
    let terminal = EmulatedTerminal::spawn_default().await?;
    let harness = build_sdk();
    let (listener, _events) = recording_listener();
    let (global, mut global_events) = recording_listener();
    harness.sdk.connection().set_connection_listener(global);
    harness
        .sdk
        .connect(
            Some(ConnectionConfig::lan(terminal.host(), terminal.port(), false)),
            listener,
        )
        .await
        .expect("connect succeeds");

    terminal.disconnect_clients();

    loop {
        if let ConnEvent::Error(code) = next_event(&mut global_events, EVENT_DEADLINE).await {
            assert_eq!(code, "213");
            break;
        }
    }
    loop {
        if let ConnEvent::Connected(device, _) =
            next_event(&mut global_events, EVENT_DEADLINE).await
        {
            assert_eq!(device, "D-7");
            break;
        }
    }
    assert!(harness.sdk.is_connected());
    Ok(())
}

#[tokio::test]
async fn manual_disconnect_disarms_auto_connect() -> eyre::Result<()> {
    let terminal = EmulatedTerminal::spawn_default().await?;
    let harness = build_sdk();
    let (listener, _events) = recording_listener();
    let (global, mut global_events) = recording_listener();
    harness.sdk.connection().set_connection_listener(global);
    harness
        .sdk
        .connect(
            Some(ConnectionConfig::lan(terminal.host(), terminal.port(), false)),
            listener,
        )
        .await
        .expect("connect succeeds");
    assert!(harness.sdk.startup_config().is_some());

    harness.sdk.disconnect().await;

    loop {
        if next_event(&mut global_events, EVENT_DEADLINE).await == ConnEvent::Disconnected {
            break;
        }
    }
    assert!(!harness.sdk.is_connected());
    // no auto-connect proposal and no reconnect loop after a manual disconnect
    assert!(harness.sdk.startup_config().is_none());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!harness.sdk.is_connected());
    let init_count = terminal
        .received()
        .iter()
        .filter(|envelope| envelope.action == Action::Init)
        .count();
    assert_eq!(init_count, 1);
    Ok(())
}

#[tokio::test]
async fn execute_without_connection_fails_with_212() -> eyre::Result<()> {
    let harness = build_sdk();
    let (callback, mut tx_events) = recording_callback();
    harness
        .sdk
        .payments()
        .sale(sale_request("O-000001", "1.00", "USD"), callback)
        .await
        .expect("sale admitted");
    match next_event(&mut tx_events, EVENT_DEADLINE).await {
        TxEvent::Failure(error) => assert_eq!(error.code, "212"),
        other => panic!("expected device-not-connected, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn invalid_sale_fails_synchronously_before_io() -> eyre::Result<()> {
    let terminal = EmulatedTerminal::spawn_default().await?;
    let harness = build_sdk();
    let (listener, _events) = recording_listener();
    harness
        .sdk
        .connect(
            Some(ConnectionConfig::lan(terminal.host(), terminal.port(), false)),
            listener,
        )
        .await
        .expect("connect succeeds");

    let (callback, mut tx_events) = recording_callback();
    let errors = harness
        .sdk
        .payments()
        .sale(sale_request("O-000001", "1.00", "US"), callback)
        .await
        .expect_err("two-letter currency is rejected");
    assert_eq!(errors[0].field, "currency");

    // nothing was sent and the callback never fires
    assert!(
        !terminal
            .received()
            .iter()
            .any(|envelope| envelope.action == Action::Sale)
    );
    assert!(tx_events.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn abort_references_the_original_trace() -> eyre::Result<()> {
    let terminal = EmulatedTerminal::spawn_default().await?;
    let harness = build_sdk();
    let (listener, _events) = recording_listener();
    harness
        .sdk
        .connect(
            Some(ConnectionConfig::lan(terminal.host(), terminal.port(), false)),
            listener,
        )
        .await
        .expect("connect succeeds");

    let (callback, mut tx_events) = recording_callback();
    let trace_id = harness
        .sdk
        .payments()
        .sale(sale_request("O-000077", "5.00", "USD"), callback)
        .await
        .expect("sale admitted");
    // drain the sale outcome
    loop {
        if matches!(
            next_event(&mut tx_events, EVENT_DEADLINE).await,
            TxEvent::Success(_) | TxEvent::Failure(_)
        ) {
            break;
        }
    }

    let (abort_callback, mut abort_events) = recording_callback();
    let abort_trace = harness
        .sdk
        .payments()
        .abort(trace_id.as_str(), abort_callback)
        .await
        .expect("abort admitted");
    assert_ne!(abort_trace, trace_id, "abort runs under its own trace id");
    loop {
        if matches!(
            next_event(&mut abort_events, EVENT_DEADLINE).await,
            TxEvent::Success(_) | TxEvent::Failure(_)
        ) {
            break;
        }
    }

    let abort_envelope = terminal
        .received()
        .into_iter()
        .find(|envelope| envelope.action == Action::Abort)
        .expect("terminal saw the abort");
    let biz = abort_envelope.biz_data.expect("abort carries bizData");
    assert_eq!(
        biz.get("originalTransactionRequestId").and_then(|v| v.as_str()),
        Some(trace_id.as_str())
    );
    assert!(biz.get("amount").is_none(), "abort carries no amount");
    Ok(())
}

#[tokio::test]
async fn concurrent_sales_get_distinct_trace_ids() -> eyre::Result<()> {
    let terminal = EmulatedTerminal::spawn_default().await?;
    let harness = build_sdk();
    let (listener, _events) = recording_listener();
    harness
        .sdk
        .connect(
            Some(ConnectionConfig::lan(terminal.host(), terminal.port(), false)),
            listener,
        )
        .await
        .expect("connect succeeds");

    let (first_cb, _first_events) = recording_callback();
    let (second_cb, _second_events) = recording_callback();
    let first = harness
        .sdk
        .payments()
        .sale(sale_request("O-000001", "1.00", "USD"), first_cb)
        .await
        .expect("first sale admitted");
    let second = harness
        .sdk
        .payments()
        .sale(sale_request("O-000002", "2.00", "USD"), second_cb)
        .await
        .expect("second sale admitted");
    assert_ne!(first, second);
    Ok(())
}
