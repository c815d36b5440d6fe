//! Flashing pipeline tests against a scripted in-process gateway
//!
//! The mock gateway speaks the real wire protocol over a loopback socket,
//! walks the selected device's status through the stages the real hardware
//! would, and records every command so the tests can assert the exact
//! sequence, the patched chunk contents, and the flow-control bounds.

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time,
};

use uf2batch::{connection::command::FLASH_CHUNK_SIZE, Connection, Flasher, Uf2Image};

const SENTINEL_LE: [u8; 4] = [0x40, 0x55, 0x55, 0xd4];

/// The gateway's receive queue depth for flash chunks
const QUEUE_DEPTH: usize = 16;

/// How long a full queue must stay quiet before the stall counts as proven
const ACK_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
enum GatewayCommand {
    Select(i8),
    StartFlash,
    WriteFlashPart(Vec<u8>),
    EndFlash,
    RebootSoft,
}

#[derive(Debug)]
struct GatewayLog {
    commands: Vec<GatewayCommand>,
    /// Highest number of received-but-unwritten chunks seen at once
    max_queued: usize,
}

/// Serves one client connection, mimicking the gateway firmware
///
/// Selecting a healthy device jumps its status straight to `flash-request`;
/// a device listed as faulty reports `error-bootsel-miss` instead. Acks are
/// what pace the client, so the mock probes both windows by withholding
/// them: the first chunk's receive ack is delayed, and write acks are held
/// back until the chunk queue fills. In both cases the client must fall
/// silent, and any byte arriving during the grace period fails the run.
/// The final chunk of a session flushes all pending write acks, since the
/// client drains its window before closing the session.
async fn run_gateway(
    listener: TcpListener,
    faulty: &[u8],
    chunks_per_session: usize,
) -> Result<GatewayLog, String> {
    let (mut stream, _) = listener.accept().await.map_err(|err| err.to_string())?;
    stream.set_nodelay(true).map_err(|err| err.to_string())?;

    let mut status = [0u8; 64];
    // Stale garbage from an earlier run; the initial reset must clear it.
    status[0] = 0x16;

    let mut commands = Vec::new();
    let mut selected = None;
    let mut session_chunk = 0usize;
    let mut queued = 0usize;
    let mut max_queued = 0usize;

    loop {
        let mut tag = [0u8; 1];

        if queued == QUEUE_DEPTH {
            // A one byte read cannot be torn by the timeout.
            match time::timeout(ACK_GRACE, stream.read_exact(&mut tag)).await {
                Ok(Err(_)) => break,
                Ok(Ok(_)) => {
                    return Err(format!(
                        "command {:#04x} arrived while the queue was full",
                        tag[0]
                    ));
                }
                Err(_) => {
                    while queued > 0 {
                        send(&mut stream, &[0x84]).await?;
                        queued -= 1;
                    }
                }
            }
        }

        if stream.read_exact(&mut tag).await.is_err() {
            break;
        }
        match tag[0] {
            // REQUEST_STATUS
            0x00 => {
                let mut reply = vec![0x80, 64, 0];
                reply.extend_from_slice(&status);
                send(&mut stream, &reply).await?;
            }
            // REQUEST_STDOUT: nothing buffered
            0x01 => send(&mut stream, &[0x81, 0, 0]).await?,
            // SELECT_DEVICE
            0x02 => {
                let device = read_byte(&mut stream).await? as i8;
                commands.push(GatewayCommand::Select(device));
                if device == -1 {
                    status = [0u8; 64];
                } else if (0..64).contains(&device) {
                    selected = Some(device as u8);
                    status[device as usize] = if faulty.contains(&(device as u8)) {
                        0x10
                    } else {
                        0x48
                    };
                }
            }
            // START_FLASH
            0x03 => {
                commands.push(GatewayCommand::StartFlash);
                session_chunk = 0;
                send(&mut stream, &[0x82]).await?;
            }
            // WRITE_FLASH_PART
            0x04 => {
                let mut length = [0u8; 2];
                stream
                    .read_exact(&mut length)
                    .await
                    .map_err(|err| err.to_string())?;
                let mut data = vec![0u8; u16::from_le_bytes(length) as usize];
                stream
                    .read_exact(&mut data)
                    .await
                    .map_err(|err| err.to_string())?;
                commands.push(GatewayCommand::WriteFlashPart(data));

                queued += 1;
                max_queued = max_queued.max(queued);
                session_chunk += 1;

                if session_chunk == 1 {
                    let mut probe = [0u8; 1];
                    match time::timeout(ACK_GRACE, stream.read_exact(&mut probe)).await {
                        Ok(Err(_)) => break,
                        Ok(Ok(_)) => {
                            return Err(format!(
                                "command {:#04x} arrived before the receive ack",
                                probe[0]
                            ));
                        }
                        Err(_) => {}
                    }
                }
                send(&mut stream, &[0x83]).await?;
                if session_chunk == chunks_per_session {
                    while queued > 0 {
                        send(&mut stream, &[0x84]).await?;
                        queued -= 1;
                    }
                }
            }
            // END_FLASH
            0x05 => {
                commands.push(GatewayCommand::EndFlash);
                send(&mut stream, &[0x85]).await?;
                if let Some(device) = selected {
                    status[device as usize] = 0x49;
                }
            }
            // REBOOT_SOFT
            0x07 => commands.push(GatewayCommand::RebootSoft),
            other => return Err(format!("unexpected command tag {other:#04x}")),
        }
    }

    Ok(GatewayLog {
        commands,
        max_queued,
    })
}

async fn send(stream: &mut TcpStream, data: &[u8]) -> Result<(), String> {
    stream.write_all(data).await.map_err(|err| err.to_string())
}

async fn read_byte(stream: &mut TcpStream) -> Result<u8, String> {
    let mut byte = [0u8; 1];
    stream
        .read_exact(&mut byte)
        .await
        .map_err(|err| err.to_string())?;
    Ok(byte[0])
}

async fn start_gateway(
    faulty: &'static [u8],
    chunks_per_session: usize,
) -> (Connection, tokio::task::JoinHandle<Result<GatewayLog, String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let gateway = tokio::spawn(run_gateway(listener, faulty, chunks_per_session));

    let connection = Connection::open("127.0.0.1", port).await.unwrap();
    (connection, gateway)
}

/// Builds an image of zeroed UF2 blocks with sentinels planted
fn image_with_sentinels(blocks: usize, offsets: &[usize]) -> Uf2Image {
    let mut data = vec![0u8; blocks * 512];
    for &offset in offsets {
        data[offset..offset + 4].copy_from_slice(&SENTINEL_LE);
    }
    Uf2Image::new(data)
}

#[tokio::test]
async fn flashes_a_single_device_end_to_end() {
    // 2048 bytes stream as one full chunk and one 592 byte tail, with one
    // sentinel landing in each chunk.
    let mut image = image_with_sentinels(4, &[32, 1600]);
    let (connection, gateway) = start_gateway(&[], 2).await;

    let mut flasher = Flasher::new(connection.clone());
    flasher.run(&mut image, [3], &mut None).await.unwrap();
    flasher.reboot_gateway().await.unwrap();
    connection.shutdown().await.unwrap();

    // The image seen on the wire is the patched one.
    assert_eq!(image.bytes()[32..36], [3, 0, 0, 0]);
    assert_eq!(image.bytes()[1600..1604], [3, 0, 0, 0]);

    let mut expected = vec![
        GatewayCommand::Select(-1),
        GatewayCommand::Select(3),
        GatewayCommand::StartFlash,
    ];
    expected.extend(
        image
            .bytes()
            .chunks(FLASH_CHUNK_SIZE)
            .map(|chunk| GatewayCommand::WriteFlashPart(chunk.to_vec())),
    );
    expected.push(GatewayCommand::EndFlash);
    expected.push(GatewayCommand::Select(64));
    expected.push(GatewayCommand::RebootSoft);

    let log = gateway.await.unwrap().unwrap();
    assert_eq!(log.commands, expected);
}

#[tokio::test]
async fn streaming_fills_but_never_overruns_the_gateway_queue() {
    // 114 blocks stream as 41 chunks, enough to wrap the ack window twice.
    let mut image = image_with_sentinels(114, &[]);
    let total_chunks = image.len().div_ceil(FLASH_CHUNK_SIZE);
    assert_eq!(total_chunks, 41);

    let (connection, gateway) = start_gateway(&[], total_chunks).await;
    let mut flasher = Flasher::new(connection.clone());
    flasher.run(&mut image, [0], &mut None).await.unwrap();
    connection.shutdown().await.unwrap();

    let log = gateway.await.unwrap().unwrap();
    assert_eq!(
        log.commands
            .iter()
            .filter(|command| matches!(command, GatewayCommand::WriteFlashPart(_)))
            .count(),
        total_chunks
    );
    // The client kept the queue exactly at its limit, never past it.
    assert_eq!(log.max_queued, QUEUE_DEPTH);
}

#[tokio::test]
async fn a_faulty_device_is_skipped_without_aborting_the_batch() {
    let mut image = image_with_sentinels(1, &[32]);
    let (connection, gateway) = start_gateway(&[5], 1).await;

    let mut flasher = Flasher::new(connection.clone());
    flasher.run(&mut image, [5, 6], &mut None).await.unwrap();
    connection.shutdown().await.unwrap();

    let log = gateway.await.unwrap().unwrap();

    // Device 5 never got past selection, device 6 was flashed in full.
    let selects: Vec<_> = log
        .commands
        .iter()
        .filter_map(|command| match command {
            GatewayCommand::Select(device) => Some(*device),
            _ => None,
        })
        .collect();
    assert_eq!(selects, vec![-1, 5, 6, 64]);

    let session: Vec<_> = log
        .commands
        .iter()
        .filter(|command| !matches!(command, GatewayCommand::Select(_)))
        .collect();
    assert_eq!(session.len(), 3, "one start, one chunk, one end: {session:?}");

    // The one device that flashed got its own index patched in.
    match log.commands.iter().find_map(|command| match command {
        GatewayCommand::WriteFlashPart(data) => Some(data),
        _ => None,
    }) {
        Some(data) => assert_eq!(data[32..36], [6, 0, 0, 0]),
        None => panic!("no chunk reached the gateway"),
    }
}
