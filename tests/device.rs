mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{Seen, Simulator, PASSWORD, SLAVE_ID};
use sun2000_modbus::modbus::{Connection, ConnectionOptions, ExceptionCode};
use sun2000_modbus::scheduler::RetryPolicy;
use sun2000_modbus::session::{Credentials, SessionOptions};
use sun2000_modbus::{Decimal, Device, Error, PollGroup, Value};

fn options() -> ConnectionOptions {
    ConnectionOptions {
        request_timeout: Duration::from_millis(200),
        reconnect_attempts: 2,
        reconnect_delay: Duration::from_millis(10),
    }
}

fn device_with(sim: &Simulator, password: Option<&str>) -> Device {
    Device::with_transport(
        Box::new(Connection::new(sim.endpoint(), options())),
        SLAVE_ID,
        password.map(|p| Credentials::new("installer", p)),
        SessionOptions::default(),
        RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(10),
        },
        64,
    )
}

async fn setup() -> (Arc<Simulator>, Device) {
    let sim = Simulator::start().await;
    let device = device_with(&sim, Some(PASSWORD));
    (sim, device)
}

#[tokio::test]
async fn test_read_active_power() {
    let (sim, device) = setup().await;
    sim.set_registers(32080, &[0x0000, 0x0BB8]).await;

    let value = device.read("active_power").await.unwrap();
    assert_eq!(value.name, "active_power");
    assert_eq!(value.value, Value::Integer(3000));
    assert_eq!(value.unit, Some("W"));
    assert_eq!(
        sim.log().await,
        vec![Seen::Read {
            address: 32080,
            count: 2
        }]
    );
}

#[tokio::test]
async fn test_read_negative_and_scaled() {
    let (sim, device) = setup().await;
    sim.set_registers(37113, &[0xFFFF, 0xFC18]).await;
    sim.set_registers(32085, &[5002]).await;

    let meter = device.read("power_meter_active_power").await.unwrap();
    assert_eq!(meter.value.as_integer(), Some(-1000));
    let frequency = device.read("grid_frequency").await.unwrap();
    assert_eq!(frequency.value.to_string(), "50.02");
}

#[tokio::test]
async fn test_unknown_quantity_never_reaches_the_wire() {
    let (sim, device) = setup().await;
    let err = device.read("flux_capacitor").await.unwrap_err();
    assert!(matches!(err, Error::UnknownQuantity(_)));
    assert!(sim.log().await.is_empty());
}

#[tokio::test]
async fn test_illegal_address_is_a_device_exception() {
    let (sim, device) = setup().await;
    sim.remove_register(37760).await;

    let err = device.read("storage_state_of_capacity").await.unwrap_err();
    assert_eq!(
        err,
        Error::DeviceException(ExceptionCode::IllegalDataAddress)
    );
    // not transient, so exactly one attempt
    assert_eq!(sim.log().await.len(), 1);
}

#[tokio::test]
async fn test_silent_device_times_out() {
    let (sim, device) = setup().await;
    sim.set_silent(true);

    let err = device.read("active_power").await.unwrap_err();
    assert!(matches!(err, Error::TransportTimeout(_)));
    assert!(err.is_transient());

    let stats = device.stats().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 2);
}

#[tokio::test]
async fn test_busy_device_is_retried() {
    let (sim, device) = setup().await;
    sim.set_registers(37760, &[555]).await;
    sim.set_busy(1);

    let soc = device.read("storage_state_of_capacity").await.unwrap();
    assert_eq!(soc.value.to_string(), "55.5");
    assert_eq!(device.stats().await.retried, 1);
}

#[tokio::test]
async fn test_read_many_merges_contiguous_registers() {
    let (sim, device) = setup().await;
    sim.set_registers(32078, &[0, 4200, 0, 3000]).await;
    sim.set_registers(32085, &[4998, 9870]).await;

    let values = device
        .read_many(&["efficiency", "active_power", "grid_frequency", "day_active_power_peak"])
        .await
        .unwrap();

    let names: Vec<_> = values.iter().map(|v| v.name).collect();
    assert_eq!(
        names,
        vec!["efficiency", "active_power", "grid_frequency", "day_active_power_peak"]
    );
    assert_eq!(values[1].value, Value::Integer(3000));
    assert_eq!(values[3].value, Value::Integer(4200));
    assert_eq!(
        sim.log().await,
        vec![
            Seen::Read {
                address: 32078,
                count: 4
            },
            Seen::Read {
                address: 32085,
                count: 2
            },
        ]
    );
}

#[tokio::test]
async fn test_read_many_fails_as_a_whole() {
    let (sim, device) = setup().await;
    sim.remove_register(37760).await;

    let err = device
        .read_many(&["active_power", "storage_state_of_capacity"])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::DeviceException(ExceptionCode::IllegalDataAddress)
    );
}

#[tokio::test]
async fn test_poll_group_reads_every_member() {
    let (_sim, device) = setup().await;
    let values = device.poll_group(PollGroup::Battery).await.unwrap();
    assert_eq!(values.len(), PollGroup::Battery.quantities().len());
}

#[tokio::test]
async fn test_only_one_request_in_transit() {
    let (sim, device) = setup().await;
    sim.set_response_delay(Duration::from_millis(20)).await;

    let reads = (0..8).map(|_| {
        let device = device.clone();
        tokio::spawn(async move { device.read("active_power").await })
    });
    for read in futures::future::join_all(reads).await {
        read.unwrap().unwrap();
    }

    assert_eq!(sim.stats.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(sim.stats.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_privileged_write_logs_in_first() {
    let (sim, device) = setup().await;
    device.write("startup", 1i64).await.unwrap();

    assert_eq!(
        sim.log().await,
        vec![
            Seen::Login,
            Seen::Write {
                address: 40200,
                words: vec![1]
            },
        ]
    );

    // the session is reused for the next write
    device.write("shutdown", 1i64).await.unwrap();
    assert_eq!(sim.logins().await, 1);
}

#[tokio::test]
async fn test_wrong_password_writes_nothing() {
    let sim = Simulator::start().await;
    let device = device_with(&sim, Some("not-the-password"));

    let err = device.write("startup", 1i64).await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed(_)));
    assert!(sim.writes().await.is_empty());
    assert_eq!(sim.register(40200).await, 0);
}

#[tokio::test]
async fn test_privileged_write_without_credentials() {
    let sim = Simulator::start().await;
    let device = device_with(&sim, None);

    let err = device.write("startup", 1i64).await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed(_)));
    assert!(sim.log().await.is_empty());
}

#[tokio::test]
async fn test_device_side_logout_triggers_relogin() {
    let (sim, device) = setup().await;
    device.write("startup", 1i64).await.unwrap();

    sim.expire_login();
    device.write("shutdown", 1i64).await.unwrap();

    assert_eq!(sim.logins().await, 2);
    assert_eq!(sim.register(40201).await, 1);
}

#[tokio::test]
async fn test_read_only_write_is_rejected_locally() {
    let (sim, device) = setup().await;
    let err = device.write("active_power", 100i64).await.unwrap_err();
    assert!(matches!(err, Error::ReadOnlyViolation(_)));
    assert!(sim.log().await.is_empty());
}

#[tokio::test]
async fn test_forcible_charge_rejects_bad_duration_before_io() {
    let (sim, device) = setup().await;

    for duration in [0, 1500] {
        let err = device.forcible_charge(2000, duration).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{duration}: {err}");
    }
    assert!(sim.log().await.is_empty());
}

#[tokio::test]
async fn test_forcible_charge_writes_in_order() {
    let (sim, device) = setup().await;
    sim.set_registers(37046, &[0, 5000]).await;

    device.forcible_charge(2000, 60).await.unwrap();

    assert_eq!(
        sim.writes().await,
        vec![
            Seen::Write {
                address: 47247,
                words: vec![0, 2000]
            },
            Seen::Write {
                address: 47083,
                words: vec![60]
            },
            Seen::Write {
                address: 47246,
                words: vec![0]
            },
            Seen::Write {
                address: 47100,
                words: vec![1]
            },
        ]
    );
}

#[tokio::test]
async fn test_forcible_charge_above_device_limit() {
    let (sim, device) = setup().await;
    sim.set_registers(37046, &[0, 5000]).await;

    let err = device.forcible_charge(6000, 60).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(sim.writes().await.is_empty());
}

#[tokio::test]
async fn test_forcible_soc_precision_checked_before_any_read() {
    let (sim, device) = setup().await;
    sim.set_registers(37046, &[0, 5000]).await;

    let err = device
        .forcible_charge_soc(2000, Decimal::new(5555, 100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
    assert!(sim.log().await.is_empty());
}

#[tokio::test]
async fn test_units_share_one_connection() {
    let (sim, primary) = setup().await;
    const SECOND: u8 = 2;
    sim.set_registers(32080, &[0x0000, 0x0BB8]).await;
    sim.set_slave_registers(SECOND, 32080, &[0x0000, 0x07D0]).await;
    let second = primary.for_slave(SECOND);

    let (a, b) = tokio::join!(primary.read("active_power"), second.read("active_power"));
    assert_eq!(a.unwrap().value, Value::Integer(3000));
    assert_eq!(b.unwrap().value, Value::Integer(2000));

    // each unit keeps its own installer session
    primary.write("startup", 1i64).await.unwrap();
    second.write("startup", 1i64).await.unwrap();
    second.write("shutdown", 1i64).await.unwrap();
    assert_eq!(sim.logins_for(SLAVE_ID).await, 1);
    assert_eq!(sim.logins_for(SECOND).await, 1);
    assert_eq!(
        sim.log_for(SECOND).await.last(),
        Some(&Seen::Write {
            address: 40201,
            words: vec![1]
        })
    );
    assert_eq!(sim.stats.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_unit_fails_without_disturbing_the_primary() {
    let (sim, primary) = setup().await;
    sim.set_registers(32080, &[0x0000, 0x0BB8]).await;

    let err = primary.for_slave(9).read("active_power").await.unwrap_err();
    assert_eq!(
        err,
        Error::DeviceException(ExceptionCode::GatewayTargetNoResponse)
    );
    let power = primary.read("active_power").await.unwrap();
    assert_eq!(power.value, Value::Integer(3000));
    assert_eq!(sim.stats.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_set_tou_periods_words() {
    let (sim, device) = setup().await;
    device
        .set_tou_periods("00:00-05:00/1234567/+\n17:00-21:00/12345/-")
        .await
        .unwrap();

    let writes = sim.writes().await;
    let [Seen::Write { address, words }] = writes.as_slice() else {
        panic!("expected one write, got {writes:?}");
    };
    assert_eq!(*address, 47255);
    assert_eq!(words.len(), 43);
    assert_eq!(&words[..7], &[2, 0, 300, 0x007F, 1020, 1260, 0x013E]);
    assert!(words[7..].iter().all(|w| *w == 0));
}

#[tokio::test]
async fn test_overlapping_tou_periods_rejected() {
    let (sim, device) = setup().await;
    let err = device
        .set_tou_periods("00:00-05:00/1234567/+\n04:00-06:00/1/-")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(sim.log().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_closes_the_device() {
    let (_sim, device) = setup().await;
    device.read("active_power").await.unwrap();
    device.shutdown().await.unwrap();

    let err = device.read("active_power").await.unwrap_err();
    assert_eq!(err, Error::SchedulerClosed);
}
