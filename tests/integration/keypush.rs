use crate::*;
use coap_lite::ResponseType;
use fogbridge_core::{DeviceId, SessionKey, KEY_SIZE};

/// Bring a device into the registry through `/req` and swallow the platform traffic.
async fn enroll(gw: &mut Gateway, device: &Device) -> Result<DeviceId> {
    device
        .send(gw.addr, &request(MessageType::Confirmable, RequestType::Post, "/req", &[1], 800))
        .await?;
    device.recv(WAIT).await.context("no reply to /req")?;
    gw.fog.expect_op("request_link").await?;
    Ok(DeviceId::from_address(&device.addr()))
}

#[tokio::test]
async fn test_key_for_unknown_identity_is_refused() -> Result<()> {
    let mut gw = Gateway::start().await?;
    let key = SessionKey::new([0x11; KEY_SIZE]);

    gw.fog.push_key("deadbeef", &key.to_hex());

    let result = gw.fog.expect_op("push_key_result").await?;
    assert_eq!(result["identity"], "deadbeef");
    assert_eq!(result["ok"], false);
    let error = result["error"].as_str().unwrap_or_default();
    assert!(error.contains("node not found"), "unexpected error: {error}");
    assert!(gw.registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_key_is_posted_to_registered_address() -> Result<()> {
    let mut gw = Gateway::start().await?;
    let device = Device::bind().await?;
    let identity = enroll(&mut gw, &device).await?;
    let key = SessionKey::new([0x42; KEY_SIZE]);

    gw.fog.push_key(&identity.to_hex(), &key.to_hex());

    let (post, from) = device.recv(WAIT).await.context("key never arrived")?;
    assert_eq!(post.header.get_type(), MessageType::Confirmable);
    assert_eq!(post.header.code, MessageClass::Request(RequestType::Post));
    assert_eq!(wire::request_path(&post), "key");
    assert_eq!(post.payload, key.as_bytes());

    device
        .send(from, &wire::ack_for(&post, ResponseType::Changed, b""))
        .await?;

    let result = gw.fog.expect_op("push_key_result").await?;
    assert_eq!(result["ok"], true);
    assert_eq!(result["identity"], identity.to_hex().as_str());

    let node = gw.registry.find_by_identity(&identity).context("node gone")?;
    assert_eq!(node.session_key, Some(key));

    // Acknowledged, so nothing is retransmitted.
    assert!(device.recv(Duration::from_millis(300)).await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_silent_device_fails_the_push() -> Result<()> {
    let mut gw = Gateway::start().await?;
    let device = Device::bind().await?;
    let identity = enroll(&mut gw, &device).await?;

    gw.fog.push_key(&identity.to_hex(), &SessionKey::new([0x07; KEY_SIZE]).to_hex());

    // First transmission plus two retransmissions, none answered.
    let mut seen = 0;
    while device.recv(Duration::from_millis(600)).await.is_some() {
        seen += 1;
    }
    assert_eq!(seen, 3);

    let result = gw.fog.expect_op("push_key_result").await?;
    assert_eq!(result["ok"], false);
    let node = gw.registry.find_by_identity(&identity).context("node gone")?;
    assert!(node.session_key.is_none());
    Ok(())
}

#[tokio::test]
async fn test_malformed_key_is_refused() -> Result<()> {
    let mut gw = Gateway::start().await?;
    let device = Device::bind().await?;
    let identity = enroll(&mut gw, &device).await?;

    gw.fog.push_key(&identity.to_hex(), "abcd");

    let result = gw.fog.expect_op("push_key_result").await?;
    assert_eq!(result["ok"], false);
    assert!(device.recv(Duration::from_millis(300)).await.is_none());
    Ok(())
}
