use crate::*;
use coap_lite::ResponseType;

#[tokio::test]
async fn test_confirmable_hello_is_answered() -> Result<()> {
    let gw = Gateway::start().await?;
    let device = Device::bind().await?;

    device
        .send(gw.addr, &request(MessageType::Confirmable, RequestType::Get, "/hello", b"", 501))
        .await?;
    let (resp, from) = device.recv(WAIT).await.context("no reply to /hello")?;

    assert_eq!(from, gw.addr);
    assert_eq!(resp.header.get_type(), MessageType::Acknowledgement);
    assert_eq!(resp.header.code, MessageClass::Response(ResponseType::Content));
    assert_eq!(resp.header.message_id, 501);
    assert_eq!(resp.get_token().to_vec(), vec![0x10, 0x20]);
    assert_eq!(resp.payload, b"hello to you too");

    // Saying hello does not make a device known.
    assert!(gw.registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_non_confirmable_hello_is_ignored() -> Result<()> {
    let gw = Gateway::start().await?;
    let device = Device::bind().await?;

    device
        .send(gw.addr, &request(MessageType::NonConfirmable, RequestType::Get, "/hello", b"", 502))
        .await?;
    assert!(device.recv(Duration::from_millis(300)).await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_unknown_path_is_not_found() -> Result<()> {
    let gw = Gateway::start().await?;
    let device = Device::bind().await?;

    device
        .send(gw.addr, &request(MessageType::Confirmable, RequestType::Get, "/nowhere", b"", 503))
        .await?;
    let (resp, _) = device.recv(WAIT).await.context("no reply for unknown path")?;
    assert_eq!(resp.header.code, MessageClass::Response(ResponseType::NotFound));
    assert_eq!(resp.header.message_id, 503);
    Ok(())
}

#[tokio::test]
async fn test_garbage_does_not_stop_the_gateway() -> Result<()> {
    let gw = Gateway::start().await?;
    let device = Device::bind().await?;

    device.socket.send_to(&[0x00, 0x01, 0x02], gw.addr).await?;
    device
        .send(gw.addr, &request(MessageType::Confirmable, RequestType::Get, "/hello", b"", 504))
        .await?;
    let (resp, _) = device.recv(WAIT).await.context("gateway stopped answering")?;
    assert_eq!(resp.header.message_id, 504);
    Ok(())
}
