//! Wire driver against an in-process scripted server
//!
//! The server speaks just enough of protocol v3 to exercise startup,
//! cleartext and SCRAM authentication, and `SHOW` queries.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use pgbackup_connect::negotiate::plan::GP_ROLE;
use pgbackup_connect::{
    AttemptStage, ConnectErrorKind, Connection, ConnectionConfig, Error, Negotiator, SslMode,
    WarningKind, WireDriver,
};
use std::time::{Duration, Instant};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const SSL_REQUEST_CODE: i32 = 80877103;

#[derive(Clone, Copy)]
enum Auth {
    Trust,
    Cleartext(&'static str),
    /// Password and PBKDF2 iteration count offered in server-first
    Scram(&'static str, u32),
    Md5,
}

#[derive(Clone)]
struct Behaviour {
    auth: Auth,
    require_gp_role: bool,
    /// Answer SSLRequest with `S`, then hang up instead of handshaking
    accept_ssl_then_close: bool,
    answers: HashMap<&'static str, &'static str>,
}

impl Behaviour {
    fn new(auth: Auth) -> Self {
        Self {
            auth,
            require_gp_role: false,
            accept_ssl_then_close: false,
            answers: HashMap::from([
                ("show archive_mode", "on"),
                ("show archive_command", "wal-g wal-push %p"),
            ]),
        }
    }
}

type StartupLog = Arc<Mutex<Vec<HashMap<String, String>>>>;

/// Start the server; returns its port and the startup parameters of every connection
async fn spawn_server(behaviour: Behaviour) -> (u16, StartupLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log = StartupLog::default();

    let server_log = log.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = listener.accept().await.unwrap();
            let behaviour = behaviour.clone();
            let log = server_log.clone();
            tokio::spawn(async move {
                let _ = serve(socket, behaviour, log).await;
            });
        }
    });
    (port, log)
}

async fn serve(mut socket: TcpStream, behaviour: Behaviour, log: StartupLog) -> std::io::Result<()> {
    let mut packet = read_startup(&mut socket).await?;
    if packet[..4] == SSL_REQUEST_CODE.to_be_bytes() {
        if behaviour.accept_ssl_then_close {
            socket.write_all(b"S").await?;
            return socket.shutdown().await;
        }
        socket.write_all(b"N").await?;
        packet = read_startup(&mut socket).await?;
    }

    let params = startup_params(&packet[4..]);
    log.lock().unwrap().push(params.clone());

    if behaviour.require_gp_role && params.get(GP_ROLE).map(String::as_str) != Some("utility") {
        socket
            .write_all(&error_response("FATAL", "XX000", "connections to a segment must use utility mode"))
            .await?;
        return Ok(());
    }

    match behaviour.auth {
        Auth::Trust => {}
        Auth::Cleartext(expected) => {
            socket.write_all(&message(b'R', &3i32.to_be_bytes())).await?;
            let (_, body) = read_message(&mut socket).await?;
            if body != [expected.as_bytes(), b"\0".as_slice()].concat() {
                socket
                    .write_all(&error_response("FATAL", "28P01", "password authentication failed"))
                    .await?;
                return Ok(());
            }
        }
        Auth::Scram(expected, iterations) => {
            if !scram_exchange(&mut socket, expected, iterations).await? {
                return Ok(());
            }
        }
        Auth::Md5 => {
            socket
                .write_all(&message(b'R', &[5i32.to_be_bytes().as_slice(), b"salt".as_slice()].concat()))
                .await?;
            return Ok(());
        }
    }

    socket.write_all(&message(b'R', &0i32.to_be_bytes())).await?;
    socket
        .write_all(&message(b'S', b"server_version\x0016.2\x00"))
        .await?;
    socket
        .write_all(&message(b'K', &[42i32.to_be_bytes(), 7i32.to_be_bytes()].concat()))
        .await?;
    socket.write_all(&message(b'Z', b"I")).await?;

    loop {
        let (tag, body) = read_message(&mut socket).await?;
        match tag {
            b'Q' => {
                let sql = String::from_utf8_lossy(&body[..body.len() - 1]).to_string();
                match behaviour.answers.get(sql.as_str()) {
                    Some(value) => {
                        let column = sql.trim_start_matches("show ");
                        socket.write_all(&row_description(column)).await?;
                        socket.write_all(&data_row(value)).await?;
                        socket.write_all(&message(b'C', b"SHOW\0")).await?;
                    }
                    None => {
                        socket
                            .write_all(&error_response("ERROR", "42704", "unrecognized configuration parameter"))
                            .await?;
                    }
                }
                socket.write_all(&message(b'Z', b"I")).await?;
            }
            b'X' => return Ok(()),
            _ => return Ok(()),
        }
    }
}

/// Server half of SCRAM-SHA-256; false when the client proof is wrong
async fn scram_exchange(
    socket: &mut TcpStream,
    password: &str,
    iterations: u32,
) -> std::io::Result<bool> {
    socket
        .write_all(&message(
            b'R',
            &[10i32.to_be_bytes().as_slice(), b"SCRAM-SHA-256\0\0".as_slice()].concat(),
        ))
        .await?;

    let (_, body) = read_message(socket).await?;
    let mechanism_end = body.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&body[..mechanism_end], b"SCRAM-SHA-256");
    let client_first = String::from_utf8(body[mechanism_end + 5..].to_vec()).unwrap();
    let client_first_bare = client_first.strip_prefix("n,,").unwrap().to_string();
    let client_nonce = client_first_bare.split_once("r=").unwrap().1.to_string();

    let salt = b"pepper";
    let server_first = format!("r={}srv,s={},i={}", client_nonce, BASE64.encode(salt), iterations);
    socket
        .write_all(&message(
            b'R',
            &[11i32.to_be_bytes().as_slice(), server_first.as_bytes()].concat(),
        ))
        .await?;

    let (_, body) = read_message(socket).await?;
    let client_final = String::from_utf8(body).unwrap();
    let (without_proof, proof) = client_final.rsplit_once(",p=").unwrap();
    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

    let mut salted = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut salted);
    let client_key = hmac(&salted, b"Client Key");
    let stored_key = Sha256::digest(&client_key);
    let signature = hmac(&stored_key, auth_message.as_bytes());
    let expected: Vec<u8> = client_key.iter().zip(&signature).map(|(k, s)| k ^ s).collect();

    if BASE64.decode(proof).unwrap() != expected {
        socket
            .write_all(&error_response("FATAL", "28P01", "password authentication failed"))
            .await?;
        return Ok(false);
    }

    let server_signature = hmac(&hmac(&salted, b"Server Key"), auth_message.as_bytes());
    let server_final = format!("v={}", BASE64.encode(server_signature));
    socket
        .write_all(&message(
            b'R',
            &[12i32.to_be_bytes().as_slice(), server_final.as_bytes()].concat(),
        ))
        .await?;
    Ok(true)
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

async fn read_startup(socket: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let len = socket.read_i32().await?;
    let mut body = vec![0u8; len as usize - 4];
    socket.read_exact(&mut body).await?;
    Ok(body)
}

async fn read_message(socket: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let tag = socket.read_u8().await?;
    let len = socket.read_i32().await?;
    let mut body = vec![0u8; len as usize - 4];
    socket.read_exact(&mut body).await?;
    Ok((tag, body))
}

fn startup_params(body: &[u8]) -> HashMap<String, String> {
    let fields: Vec<String> = body
        .split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).to_string())
        .collect();
    fields
        .chunks(2)
        .filter(|pair| pair.len() == 2 && !pair[0].is_empty())
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

fn message(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn error_response(severity: &str, code: &str, text: &str) -> Vec<u8> {
    let body = format!("S{}\0C{}\0M{}\0\0", severity, code, text);
    message(b'E', body.as_bytes())
}

fn row_description(column: &str) -> Vec<u8> {
    let mut body = 1i16.to_be_bytes().to_vec();
    body.extend_from_slice(column.as_bytes());
    body.push(0);
    body.extend_from_slice(&0i32.to_be_bytes()); // table oid
    body.extend_from_slice(&0i16.to_be_bytes()); // column attr
    body.extend_from_slice(&25i32.to_be_bytes()); // text
    body.extend_from_slice(&(-1i16).to_be_bytes());
    body.extend_from_slice(&(-1i32).to_be_bytes());
    body.extend_from_slice(&0i16.to_be_bytes());
    message(b'T', &body)
}

fn data_row(value: &str) -> Vec<u8> {
    let mut body = 1i16.to_be_bytes().to_vec();
    body.extend_from_slice(&(value.len() as i32).to_be_bytes());
    body.extend_from_slice(value.as_bytes());
    message(b'D', &body)
}

fn config(port: u16, sslmode: SslMode) -> pgbackup_connect::ConnectionConfigBuilder {
    ConnectionConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .user("backup")
        .database("postgres")
        .sslmode(sslmode)
}

#[tokio::test]
async fn test_trust_startup_and_show() {
    let (port, log) = spawn_server(Behaviour::new(Auth::Trust)).await;
    let config = config(port, SslMode::Disable)
        .application_name("archiver")
        .build();

    let mut conn = assert_ok!(Connection::connect(&config).await);
    assert_eq!(conn.parameter("server_version"), Some("16.2"));
    assert_eq!(conn.process_id(), Some(42));
    assert!(!conn.is_tls());

    assert_eq!(assert_ok!(conn.query_scalar("show archive_mode").await), "on");
    let result = assert_ok!(conn.simple_query("show archive_command").await);
    assert_eq!(result.columns, vec!["archive_command"]);
    assert_eq!(result.command_tag.as_deref(), Some("SHOW"));
    assert_ok!(conn.close().await);

    let params = log.lock().unwrap()[0].clone();
    assert_eq!(params["user"], "backup");
    assert_eq!(params["database"], "postgres");
    assert_eq!(params["application_name"], "archiver");
}

#[tokio::test]
async fn test_server_error_leaves_connection_usable() {
    let (port, _) = spawn_server(Behaviour::new(Auth::Trust)).await;
    let mut conn = assert_ok!(Connection::connect(&config(port, SslMode::Disable).build()).await);

    let err = assert_err!(conn.query_scalar("show no_such_setting").await);
    assert!(matches!(err, Error::Sql(ref m) if m.contains("42704")), "{}", err);

    assert_eq!(assert_ok!(conn.query_scalar("show archive_mode").await), "on");
}

#[tokio::test]
async fn test_prefer_falls_back_to_plaintext() {
    let (port, _) = spawn_server(Behaviour::new(Auth::Trust)).await;
    let conn = assert_ok!(Connection::connect(&config(port, SslMode::Prefer).build()).await);
    assert!(!conn.is_tls());
}

#[tokio::test]
async fn test_prefer_does_not_retry_plaintext_after_failed_handshake() {
    let mut behaviour = Behaviour::new(Auth::Trust);
    behaviour.accept_ssl_then_close = true;
    let (port, log) = spawn_server(behaviour).await;

    assert_err!(Connection::connect(&config(port, SslMode::Prefer).build()).await);
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_require_rejects_plaintext_server() {
    let (port, _) = spawn_server(Behaviour::new(Auth::Trust)).await;
    let err = assert_err!(Connection::connect(&config(port, SslMode::Require).build()).await);
    assert!(matches!(err, Error::Config(_)), "{}", err);
}

#[tokio::test]
async fn test_cleartext_password() {
    let (port, _) = spawn_server(Behaviour::new(Auth::Cleartext("hunter2"))).await;

    let good = config(port, SslMode::Disable).password("hunter2").build();
    assert_ok!(Connection::connect(&good).await);

    let bad = config(port, SslMode::Disable).password("wrong").build();
    let err = assert_err!(Connection::connect(&bad).await);
    assert!(matches!(err, Error::Authentication(ref m) if m.contains("28P01")), "{}", err);

    let missing = config(port, SslMode::Disable).build();
    let err = assert_err!(Connection::connect(&missing).await);
    assert!(matches!(err, Error::Authentication(_)), "{}", err);
}

#[tokio::test]
async fn test_scram_authentication() {
    let (port, _) = spawn_server(Behaviour::new(Auth::Scram("s3cret", 4096))).await;

    let good = config(port, SslMode::Disable).password("s3cret").build();
    let mut conn = assert_ok!(Connection::connect(&good).await);
    assert_eq!(assert_ok!(conn.query_scalar("show archive_mode").await), "on");

    let bad = config(port, SslMode::Disable).password("guess").build();
    let err = assert_err!(Connection::connect(&bad).await);
    assert!(matches!(err, Error::Authentication(_)), "{}", err);
}

#[tokio::test]
async fn test_scram_iteration_count_above_limit_is_rejected() {
    let (port, _) = spawn_server(Behaviour::new(Auth::Scram("s3cret", 4_000_000_000))).await;
    let config = config(port, SslMode::Disable).password("s3cret").build();

    let started = Instant::now();
    let err = assert_err!(Connection::connect(&config).await);
    assert!(matches!(err, Error::Authentication(ref m) if m.contains("iteration")), "{}", err);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancel_interrupts_scram_key_derivation() {
    // At the limit, slow enough that cancellation lands mid-derivation
    let (port, _) = spawn_server(Behaviour::new(Auth::Scram("s3cret", 1_000_000))).await;
    let base = config(port, SslMode::Disable)
        .password("s3cret")
        .validate()
        .expect("valid");

    let ctx = CancellationToken::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        Negotiator::new(WireDriver).negotiate(&ctx, &base),
    )
    .await
    .expect("negotiation did not return after cancellation");

    let err = assert_err!(result);
    assert_eq!(err.kind(), ConnectErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
}

#[tokio::test]
async fn test_md5_is_rejected() {
    let (port, _) = spawn_server(Behaviour::new(Auth::Md5)).await;
    let config = config(port, SslMode::Disable).password("pw").build();
    let err = assert_err!(Connection::connect(&config).await);
    assert!(matches!(err, Error::Authentication(ref m) if m.contains("MD5")), "{}", err);
}

#[tokio::test]
async fn test_negotiator_reaches_segment_in_utility_mode() {
    let mut behaviour = Behaviour::new(Auth::Trust);
    behaviour.require_gp_role = true;
    behaviour.answers.insert("show archive_command", "(disabled)");
    let (port, log) = spawn_server(behaviour).await;

    let base = config(port, SslMode::Disable).validate().expect("valid");
    let negotiated = assert_ok!(
        Negotiator::new(WireDriver)
            .negotiate(&CancellationToken::new(), &base)
            .await
    );

    assert_eq!(negotiated.stage, AttemptStage::SegmentGpRole);
    assert_eq!(negotiated.history.len(), 1);
    assert!(negotiated.history[0].error.contains("utility mode"));
    assert_eq!(
        negotiated.warnings.iter().map(|w| w.kind).collect::<Vec<_>>(),
        vec![WarningKind::ArchiveCommandMissing]
    );

    let startups = log.lock().unwrap().clone();
    assert_eq!(startups.len(), 2);
    assert!(!startups[0].contains_key(GP_ROLE));
    assert_eq!(startups[1][GP_ROLE], "utility");

    assert_ok!(negotiated.into_session().close().await);
}
