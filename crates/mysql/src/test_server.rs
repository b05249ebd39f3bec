//! A scripted MySQL server over an in-memory duplex stream. It performs a
//! real handshake (verifying the client's scramble) and then answers each
//! command from a queue of canned responses.

use std::{
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::io::DuplexStream;

use crate::{
    auth::{
        scramble_caching_sha2,
        scramble_native,
    },
    constants::*,
    conn::{
        Connection,
        MaybeTlsStream,
        MySqlConfig,
    },
    packet::{
        put_lenenc_bytes,
        put_lenenc_int,
        read_payload,
        write_payload,
        PayloadReader,
    },
    value::Value,
};

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) const TEST_NONCE: [u8; 20] = [
    0x52, 0x07, 0x2d, 0x6f, 0x74, 0x2c, 0x2b, 0x0b, 0x41, 0x21, 0x32, 0x0f, 0x68, 0x7d, 0x16,
    0x52, 0x30, 0x03, 0x34, 0x1c,
];

#[derive(Clone)]
pub(crate) enum Canned {
    Ok {
        affected_rows: u64,
        last_insert_id: u64,
        status_flags: u16,
    },
    Rows {
        columns: Vec<(&'static str, u8)>,
        rows: Vec<Vec<Value>>,
        status_flags: u16,
    },
    Err {
        code: u16,
        sql_state: &'static str,
        message: &'static str,
    },
    /// A frame with a wrong sequence id, to poison the client.
    Garbage,
}

impl Canned {
    pub fn ok() -> Self {
        Canned::Ok {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
        }
    }

    pub fn ok_with(affected_rows: u64, status_flags: u16) -> Self {
        Canned::Ok {
            affected_rows,
            last_insert_id: 0,
            status_flags,
        }
    }
}

#[derive(Clone)]
pub(crate) struct ServerScript {
    pub plugin: &'static str,
    /// Send the caching_sha2 fast-auth success marker before the final OK.
    pub fast_auth_marker: bool,
    pub command_delay: Option<Duration>,
    pub responses: Vec<Canned>,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            plugin: AUTH_PLUGIN_NATIVE,
            fast_auth_marker: false,
            command_delay: None,
            responses: Vec::new(),
        }
    }
}

pub(crate) struct TestServer {
    pub received: Arc<Mutex<Vec<String>>>,
}

pub(crate) fn test_config() -> MySqlConfig {
    MySqlConfig {
        host: "testserver".to_owned(),
        user: "app".to_owned(),
        password: "pw".to_owned(),
        database: Some("test".to_owned()),
        ..Default::default()
    }
}

/// Spawn a scripted server and hand back an authenticated connection to it.
pub(crate) async fn spawn_server(script: ServerScript) -> (Connection, TestServer) {
    let (client_end, server_end) = tokio::io::duplex(1 << 20);
    let received = Arc::new(Mutex::new(Vec::new()));
    let server = TestServer {
        received: received.clone(),
    };
    tokio::spawn(serve(server_end, script, received));
    let config = test_config();
    let conn = Connection::handshake_over(MaybeTlsStream::Duplex(client_end), &config)
        .await
        .expect("test handshake failed");
    (conn, server)
}

fn build_greeting(plugin: &str, connection_id: u32) -> Vec<u8> {
    let caps = BASE_CAPABILITIES | CLIENT_CONNECT_WITH_DB;
    let mut out = vec![PROTOCOL_VERSION];
    out.extend_from_slice(b"8.0.36-test\0");
    out.extend_from_slice(&connection_id.to_le_bytes());
    out.extend_from_slice(&TEST_NONCE[..8]);
    out.push(0);
    out.extend_from_slice(&(caps as u16).to_le_bytes());
    out.push(DEFAULT_CHARSET);
    out.extend_from_slice(&SERVER_STATUS_AUTOCOMMIT.to_le_bytes());
    out.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
    out.push(21);
    out.extend_from_slice(&[0u8; 10]);
    out.extend_from_slice(&TEST_NONCE[8..]);
    out.push(0);
    out.extend_from_slice(plugin.as_bytes());
    out.push(0);
    out
}

fn ok_payload(affected_rows: u64, last_insert_id: u64, status_flags: u16) -> Vec<u8> {
    let mut out = vec![0x00];
    put_lenenc_int(&mut out, affected_rows);
    put_lenenc_int(&mut out, last_insert_id);
    out.extend_from_slice(&status_flags.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

fn err_payload(code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut out = vec![0xff];
    out.extend_from_slice(&code.to_le_bytes());
    out.push(b'#');
    out.extend_from_slice(sql_state.as_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}

fn eof_payload(status_flags: u16) -> Vec<u8> {
    let mut out = vec![0xfe];
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&status_flags.to_le_bytes());
    out
}

fn column_payload(name: &str, column_type: u8) -> Vec<u8> {
    let mut out = Vec::new();
    put_lenenc_bytes(&mut out, b"def");
    put_lenenc_bytes(&mut out, b"test");
    put_lenenc_bytes(&mut out, b"t");
    put_lenenc_bytes(&mut out, b"t");
    put_lenenc_bytes(&mut out, name.as_bytes());
    put_lenenc_bytes(&mut out, name.as_bytes());
    put_lenenc_int(&mut out, 0x0c);
    out.extend_from_slice(&(DEFAULT_CHARSET as u16).to_le_bytes());
    out.extend_from_slice(&255u32.to_le_bytes());
    out.push(column_type);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.push(0);
    out.extend_from_slice(&[0, 0]);
    out
}

fn text_cell(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Null => None,
        Value::Int(v) => Some(v.to_string().into_bytes()),
        Value::UInt(v) => Some(v.to_string().into_bytes()),
        Value::Float(v) => Some(v.to_string().into_bytes()),
        Value::Double(v) => Some(v.to_string().into_bytes()),
        Value::Bytes(raw) => Some(raw.clone()),
        other => Some(format!("{other:?}").into_bytes()),
    }
}

async fn write_rows(
    stream: &mut DuplexStream,
    columns: &[(&'static str, u8)],
    rows: &[Vec<Value>],
    status_flags: u16,
    binary: bool,
) -> std::io::Result<()> {
    let mut seq = 1u8;
    let mut head = Vec::new();
    put_lenenc_int(&mut head, columns.len() as u64);
    seq = write_or_io(stream, seq, &head).await?;
    for (name, column_type) in columns {
        seq = write_or_io(stream, seq, &column_payload(name, *column_type)).await?;
    }
    seq = write_or_io(stream, seq, &eof_payload(status_flags)).await?;
    for row in rows {
        let mut payload = Vec::new();
        if binary {
            payload.push(0x00);
            let bitmap_len = (columns.len() + 7 + 2) / 8;
            let mut bitmap = vec![0u8; bitmap_len];
            for (index, value) in row.iter().enumerate() {
                if value.is_null() {
                    let bit = index + 2;
                    bitmap[bit / 8] |= 1 << (bit % 8);
                }
            }
            payload.extend_from_slice(&bitmap);
            for value in row {
                value.encode_binary(&mut payload);
            }
        } else {
            for value in row {
                match text_cell(value) {
                    Some(cell) => put_lenenc_bytes(&mut payload, &cell),
                    None => payload.push(0xfb),
                }
            }
        }
        seq = write_or_io(stream, seq, &payload).await?;
    }
    write_or_io(stream, seq, &eof_payload(status_flags)).await?;
    Ok(())
}

async fn write_or_io(stream: &mut DuplexStream, seq: u8, payload: &[u8]) -> std::io::Result<u8> {
    write_payload(stream, seq, payload)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

async fn read_or_io(stream: &mut DuplexStream, buffer: &mut Vec<u8>) -> std::io::Result<(u8, u8)> {
    read_payload(stream, buffer)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

async fn respond(
    stream: &mut DuplexStream,
    canned: Canned,
    binary: bool,
) -> std::io::Result<()> {
    match canned {
        Canned::Ok {
            affected_rows,
            last_insert_id,
            status_flags,
        } => {
            write_or_io(stream, 1, &ok_payload(affected_rows, last_insert_id, status_flags))
                .await?;
        },
        Canned::Err {
            code,
            sql_state,
            message,
        } => {
            write_or_io(stream, 1, &err_payload(code, sql_state, message)).await?;
        },
        Canned::Rows {
            columns,
            rows,
            status_flags,
        } => {
            write_rows(stream, &columns, &rows, status_flags, binary).await?;
        },
        Canned::Garbage => {
            write_or_io(stream, 9, &[0x00]).await?;
        },
    }
    Ok(())
}

async fn serve(
    mut stream: DuplexStream,
    script: ServerScript,
    received: Arc<Mutex<Vec<String>>>,
) {
    if serve_inner(&mut stream, script, received).await.is_err() {
        // The client went away; nothing to clean up.
    }
}

async fn serve_inner(
    stream: &mut DuplexStream,
    script: ServerScript,
    received: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst);
    let mut buffer = Vec::new();

    // Handshake.
    write_or_io(stream, 0, &build_greeting(script.plugin, connection_id)).await?;
    let (_, mut seq) = read_or_io(stream, &mut buffer).await?;
    {
        let mut reader = PayloadReader::new(&buffer);
        let _caps = reader.u32_le().map_err(to_io)?;
        let _max_packet = reader.u32_le().map_err(to_io)?;
        let _charset = reader.u8().map_err(to_io)?;
        reader.skip(23).map_err(to_io)?;
        let user = reader.null_terminated().map_err(to_io)?.to_vec();
        let auth_len = reader.u8().map_err(to_io)? as usize;
        let auth = reader.take(auth_len).map_err(to_io)?.to_vec();
        let expected = match script.plugin {
            AUTH_PLUGIN_CACHING_SHA2 => scramble_caching_sha2(b"pw", &TEST_NONCE),
            _ => scramble_native(b"pw", &TEST_NONCE),
        };
        if user != b"app" || auth != expected {
            write_or_io(stream, seq, &err_payload(1045, "28000", "Access denied")).await?;
            return Ok(());
        }
    }
    if script.fast_auth_marker {
        seq = write_or_io(stream, seq, &[0x01, 0x03]).await?;
    }
    write_or_io(
        stream,
        seq,
        &ok_payload(0, 0, SERVER_STATUS_AUTOCOMMIT),
    )
    .await?;

    // Command loop.
    let mut responses: std::collections::VecDeque<Canned> = script.responses.into();
    let mut next_statement_id = 1u32;
    loop {
        let Ok((_, _)) = read_or_io(stream, &mut buffer).await else {
            return Ok(());
        };
        let Some(&command) = buffer.first() else {
            return Ok(());
        };
        match command {
            COM_QUIT => return Ok(()),
            COM_PING => {
                write_or_io(stream, 1, &ok_payload(0, 0, SERVER_STATUS_AUTOCOMMIT)).await?;
            },
            COM_QUERY => {
                let sql = String::from_utf8_lossy(&buffer[1..]).into_owned();
                received.lock().push(sql);
                if let Some(delay) = script.command_delay {
                    tokio::time::sleep(delay).await;
                }
                let canned = responses.pop_front().unwrap_or_else(Canned::ok);
                respond(stream, canned, false).await?;
            },
            COM_STMT_PREPARE => {
                let sql = String::from_utf8_lossy(&buffer[1..]).into_owned();
                let num_params = sql.matches('?').count() as u16;
                received.lock().push(sql);
                let id = next_statement_id;
                next_statement_id += 1;
                let mut ok = vec![0x00];
                ok.extend_from_slice(&id.to_le_bytes());
                ok.extend_from_slice(&0u16.to_le_bytes());
                ok.extend_from_slice(&num_params.to_le_bytes());
                ok.push(0);
                ok.extend_from_slice(&0u16.to_le_bytes());
                let mut seq = write_or_io(stream, 1, &ok).await?;
                for _ in 0..num_params {
                    seq = write_or_io(stream, seq, &column_payload("?", TYPE_VAR_STRING)).await?;
                }
                if num_params > 0 {
                    write_or_io(stream, seq, &eof_payload(SERVER_STATUS_AUTOCOMMIT)).await?;
                }
            },
            COM_STMT_EXECUTE => {
                received.lock().push("<execute>".to_owned());
                if let Some(delay) = script.command_delay {
                    tokio::time::sleep(delay).await;
                }
                let canned = responses.pop_front().unwrap_or_else(Canned::ok);
                respond(stream, canned, true).await?;
            },
            COM_STMT_CLOSE => {
                received.lock().push("<close statement>".to_owned());
            },
            other => {
                write_or_io(
                    stream,
                    1,
                    &err_payload(1047, "08S01", &format!("unknown command {other}")),
                )
                .await?;
            },
        }
    }
}

fn to_io(e: common::Error) -> std::io::Error {
    std::io::Error::other(e.to_string())
}
