//! Codec Tests
//!
//! Tests for RESP2 command and reply encoding/decoding.

use bytes::{Bytes, BytesMut};

use coalescekv::protocol::{
    decode_command, decode_reply, encode_command, encode_command_into, encode_reply,
    read_command, read_reply, write_reply, Command, CommandType, Reply,
};
use coalescekv::CacheError;

// =============================================================================
// Command Encoding Tests
// =============================================================================

#[test]
fn test_encode_get() {
    let cmd = Command::Get {
        key: "hello".to_string(),
    };

    assert_eq!(
        encode_command(&cmd),
        Bytes::from_static(b"*2\r\n$3\r\nGET\r\n$5\r\nhello\r\n")
    );
}

#[test]
fn test_encode_setex() {
    let cmd = Command::SetEx {
        key: "k".to_string(),
        ttl: 30,
        value: Bytes::from("v"),
    };

    assert_eq!(
        encode_command(&cmd),
        Bytes::from_static(b"*4\r\n$5\r\nSETEX\r\n$1\r\nk\r\n$2\r\n30\r\n$1\r\nv\r\n")
    );
}

#[test]
fn test_encode_cluster_slots() {
    assert_eq!(
        encode_command(&Command::ClusterSlots),
        Bytes::from_static(b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nSLOTS\r\n")
    );
}

#[test]
fn test_decode_pipelined_commands() {
    let commands = vec![
        Command::MSet {
            pairs: vec![
                ("a_v".to_string(), Bytes::from("1")),
                ("a_d".to_string(), Bytes::from("{\"x\":1}")),
            ],
        },
        Command::MGet {
            keys: vec!["a_v".to_string(), "a_d".to_string()],
        },
        Command::Del {
            keys: vec!["a_v".to_string(), "a_d".to_string()],
        },
        Command::Auth {
            password: "secret".to_string(),
        },
        Command::Select { db: 3 },
        Command::Ping,
        Command::Quit,
    ];

    let mut buf = BytesMut::new();
    for command in &commands {
        encode_command_into(command, &mut buf);
    }

    for expected in commands {
        assert_eq!(decode_command(&mut buf).unwrap(), Some(expected));
    }
    assert!(buf.is_empty());
    assert_eq!(decode_command(&mut buf).unwrap(), None);
}

#[test]
fn test_decode_command_is_case_insensitive() {
    let mut buf = BytesMut::from(&b"*2\r\n$3\r\nget\r\n$1\r\nk\r\n"[..]);

    let command = decode_command(&mut buf).unwrap().unwrap();

    assert_eq!(command.command_type(), CommandType::Get);
    assert_eq!(command.keys(), vec!["k"]);
}

#[test]
fn test_decode_auth_with_username() {
    let mut buf = BytesMut::from(&b"*3\r\n$4\r\nAUTH\r\n$4\r\nuser\r\n$2\r\npw\r\n"[..]);

    assert_eq!(
        decode_command(&mut buf).unwrap(),
        Some(Command::Auth {
            password: "pw".to_string()
        })
    );
}

#[test]
fn test_decode_unknown_command() {
    let mut buf = BytesMut::from(&b"*1\r\n$5\r\nFLUSH\r\n"[..]);

    assert!(matches!(
        decode_command(&mut buf),
        Err(CacheError::Protocol(_))
    ));
}

#[test]
fn test_decode_command_wrong_arity() {
    let mut buf = BytesMut::from(&b"*2\r\n$3\r\nSET\r\n$1\r\nk\r\n"[..]);

    assert!(matches!(
        decode_command(&mut buf),
        Err(CacheError::Protocol(_))
    ));
}

#[test]
fn test_command_keys() {
    let mset = Command::MSet {
        pairs: vec![
            ("x".to_string(), Bytes::from("1")),
            ("y".to_string(), Bytes::from("2")),
        ],
    };

    assert_eq!(mset.keys(), vec!["x", "y"]);
    assert!(Command::Ping.keys().is_empty());
    assert_eq!(CommandType::MSet.name(), "MSET");
}

// =============================================================================
// Reply Encoding/Decoding Tests
// =============================================================================

#[test]
fn test_encode_replies() {
    assert_eq!(encode_reply(&Reply::ok()), Bytes::from_static(b"+OK\r\n"));
    assert_eq!(
        encode_reply(&Reply::error("ERR boom")),
        Bytes::from_static(b"-ERR boom\r\n")
    );
    assert_eq!(encode_reply(&Reply::Integer(-4)), Bytes::from_static(b":-4\r\n"));
    assert_eq!(encode_reply(&Reply::nil()), Bytes::from_static(b"$-1\r\n"));
    assert_eq!(
        encode_reply(&Reply::Array(Some(vec![Reply::bulk("1"), Reply::nil()]))),
        Bytes::from_static(b"*2\r\n$1\r\n1\r\n$-1\r\n")
    );
    assert_eq!(encode_reply(&Reply::Array(None)), Bytes::from_static(b"*-1\r\n"));
}

#[test]
fn test_decode_nested_reply() {
    let reply = Reply::Array(Some(vec![Reply::Array(Some(vec![
        Reply::Integer(0),
        Reply::Integer(5460),
        Reply::Array(Some(vec![Reply::bulk("127.0.0.1"), Reply::Integer(7000)])),
    ]))]));
    let mut buf = BytesMut::from(&encode_reply(&reply)[..]);

    assert_eq!(decode_reply(&mut buf).unwrap(), Some(reply));
    assert!(buf.is_empty());
}

#[test]
fn test_decode_binary_bulk() {
    let payload = Bytes::from_static(b"line\r\nbreak\x00\xff");
    let mut buf = BytesMut::from(&encode_reply(&Reply::bulk(payload.clone()))[..]);

    assert_eq!(decode_reply(&mut buf).unwrap(), Some(Reply::bulk(payload)));
}

#[test]
fn test_decode_incomplete_frame_waits() {
    let full = encode_reply(&Reply::Array(Some(vec![
        Reply::bulk("hello"),
        Reply::Integer(42),
    ])));

    for cut in 0..full.len() {
        let mut buf = BytesMut::from(&full[..cut]);
        assert_eq!(decode_reply(&mut buf).unwrap(), None);
        // Nothing consumed
        assert_eq!(buf.len(), cut);
    }
}

#[test]
fn test_decode_invalid_prefix() {
    let mut buf = BytesMut::from(&b"?what\r\n"[..]);

    assert!(matches!(decode_reply(&mut buf), Err(CacheError::Protocol(_))));
}

#[test]
fn test_decode_bulk_without_crlf() {
    let mut buf = BytesMut::from(&b"$3\r\nabcXY"[..]);

    assert!(matches!(decode_reply(&mut buf), Err(CacheError::Protocol(_))));
}

#[test]
fn test_decode_invalid_integer() {
    let mut buf = BytesMut::from(&b":12a\r\n"[..]);

    assert!(matches!(decode_reply(&mut buf), Err(CacheError::Protocol(_))));
}

#[test]
fn test_reply_accessors() {
    assert_eq!(
        Reply::error("ERR x").into_result(),
        Err(CacheError::Command("ERR x".to_string()))
    );
    assert_eq!(Reply::bulk("v").into_bulk().unwrap(), Some(Bytes::from("v")));
    assert!(matches!(Reply::ok().into_bulk(), Err(CacheError::Protocol(_))));
    assert_eq!(Reply::Array(None).into_array().unwrap(), Vec::<Reply>::new());
    assert_eq!(Reply::Integer(3).as_integer(), Some(3));
    assert!(Reply::error("ERR").is_error());
}

// =============================================================================
// Stream I/O Tests
// =============================================================================

#[tokio::test]
async fn test_stream_round_trip() {
    let (mut client, mut server) = tokio::io::duplex(64);

    let writer = tokio::spawn(async move {
        write_reply(&mut server, &Reply::ok()).await.unwrap();
        write_reply(&mut server, &Reply::bulk(vec![7u8; 1000])).await.unwrap();
    });

    let mut buf = BytesMut::new();
    assert_eq!(read_reply(&mut client, &mut buf).await.unwrap(), Reply::ok());
    assert_eq!(
        read_reply(&mut client, &mut buf).await.unwrap(),
        Reply::bulk(vec![7u8; 1000])
    );
    writer.await.unwrap();
}

#[tokio::test]
async fn test_read_command_clean_eof() {
    let (client, mut server) = tokio::io::duplex(64);
    drop(client);

    let mut buf = BytesMut::new();
    assert_eq!(read_command(&mut server, &mut buf).await.unwrap(), None);
}

#[tokio::test]
async fn test_read_reply_eof_is_connection_error() {
    let (client, mut server) = tokio::io::duplex(64);
    drop(client);

    let mut buf = BytesMut::new();
    assert!(matches!(
        read_reply(&mut server, &mut buf).await,
        Err(CacheError::Connection(_))
    ));
}
