use crate::*;
use coap_lite::ResponseType;
use fogbridge_core::{DeviceId, LinkContract};

async fn link_request(device: &Device, gw: &Gateway, payload: &[u8], message_id: u16) -> Result<Option<Packet>> {
    device
        .send(gw.addr, &request(MessageType::Confirmable, RequestType::Post, "/req", payload, message_id))
        .await?;
    Ok(device.recv(Duration::from_millis(500)).await.map(|(p, _)| p))
}

/// Unseen device asks for a link of type 1, then asks again with type 0.
#[tokio::test]
async fn test_new_device_is_registered_then_bad_type_is_dropped() -> Result<()> {
    let mut gw = Gateway::start().await?;
    let device = Device::bind().await?;
    let identity = DeviceId::from_address(&device.addr()).to_hex();

    let resp = link_request(&device, &gw, &wire::encode_uvarint(1), 700)
        .await?
        .context("no reply to /req")?;
    assert_eq!(resp.header.code, MessageClass::Response(ResponseType::Content));
    assert_eq!(resp.header.message_id, 700);
    assert_eq!(resp.payload, b"link request forwarded");

    let nodes = gw.registry.snapshot();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].addr, device.addr());
    assert!(nodes[0].registered);
    assert_eq!(nodes[0].link, Some(LinkContract::from_hex(LINK_CONTRACT)?));

    let register = gw.fog.expect_op("register_device").await?;
    assert_eq!(register["identity"], identity.as_str());
    assert_eq!(register["inf_type"], 1);
    assert_eq!(register["is_provider"], false);
    assert_eq!(register["address"], "gw.test:2001");
    assert_eq!(register["kind"], "sixlowpan");

    let link = gw.fog.expect_op("request_link").await?;
    assert_eq!(link["identity"], identity.as_str());
    assert_eq!(link["inf_type"], 1);
    assert!(gw.fog.drain().is_empty(), "one registration, one link request");

    // Type 0 is not a valid interface type.
    assert!(link_request(&device, &gw, &wire::encode_uvarint(0), 701).await?.is_none());
    assert!(gw.fog.next_frame().await.is_none(), "no platform call for a bad type");
    assert_eq!(gw.registry.snapshot(), nodes);
    Ok(())
}

#[tokio::test]
async fn test_known_device_links_without_registering_again() -> Result<()> {
    let mut gw = Gateway::start().await?;
    let device = Device::bind().await?;

    link_request(&device, &gw, &[1], 710).await?.context("first /req")?;
    link_request(&device, &gw, &[5], 711).await?.context("second /req")?;

    let ops: Vec<String> = gw
        .fog
        .drain()
        .iter()
        .map(|f| f["op"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(ops, ["register_device", "request_link", "request_link"]);
    assert_eq!(gw.registry.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_rejected_registration_is_silent_and_retried() -> Result<()> {
    let fog = FakeFog::start(&["register_device"]).await?;
    let mut gw = Gateway::start_with(fog, false, "[::1]:0").await?;
    let device = Device::bind().await?;

    assert!(link_request(&device, &gw, &[1], 720).await?.is_none());
    gw.fog.expect_op("register_device").await?;
    let node = gw.registry.find_by_address(&device.addr()).context("node kept")?;
    assert!(!node.registered);

    assert!(link_request(&device, &gw, &[1], 721).await?.is_none());
    gw.fog.expect_op("register_device").await?;
    assert!(gw.fog.drain().iter().all(|f| f["op"] != "request_link"));
    Ok(())
}

#[tokio::test]
async fn test_explicit_errors_report_failures() -> Result<()> {
    let fog = FakeFog::start(&["request_link"]).await?;
    let gw = Gateway::start_with(fog, true, "[::1]:0").await?;
    let device = Device::bind().await?;

    let resp = link_request(&device, &gw, &[], 730).await?.context("empty payload reply")?;
    assert_eq!(resp.header.code, MessageClass::Response(ResponseType::BadRequest));

    let resp = link_request(&device, &gw, &[1], 731).await?.context("rejected link reply")?;
    assert_eq!(resp.header.code, MessageClass::Response(ResponseType::BadGateway));
    Ok(())
}
