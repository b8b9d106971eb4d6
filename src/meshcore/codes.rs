//! MeshCore companion protocol wire constants.

pub const CMD_APP_START: u8 = 1;
pub const CMD_SEND_TXT_MSG: u8 = 2;
pub const CMD_SEND_CHANNEL_TXT_MSG: u8 = 3;
pub const CMD_SYNC_NEXT_MESSAGE: u8 = 6;
pub const CMD_DEVICE_QUERY: u8 = 0x16;
pub const CMD_GET_CHANNEL: u8 = 0x1F;

pub const RESP_OK: u8 = 0;
pub const RESP_ERR: u8 = 1;
pub const RESP_SELF_INFO: u8 = 5;
pub const RESP_SENT: u8 = 6;
pub const RESP_CONTACT_MSG_RECV: u8 = 8;
pub const RESP_CONTACT_MSG_RECV_V3: u8 = 9;
pub const RESP_CHANNEL_MSG_RECV: u8 = 10;
pub const RESP_CHANNEL_MSG_RECV_V3: u8 = 11;
pub const RESP_DEVICE_INFO: u8 = 0x0D;
pub const RESP_CHANNEL_INFO: u8 = 0x12;

pub const PUSH_MSG_WAITING: u8 = 14;
pub const PUSH_SEND_CONFIRMED: u8 = 15;

/// Codes at or above this are always unsolicited pushes.
pub const PUSH_CODE_FLOOR: u8 = 0x80;

/// Highest response code this host understands. Anything above it that
/// follows a capture is continuation data from a fragmented response.
pub const MAX_KNOWN_RESPONSE_CODE: u8 = 0x1F;

pub const TXT_TYPE_PLAIN: u8 = 0;
pub const TXT_TYPE_SIGNED: u8 = 1;

pub const PROTOCOL_VERSION: u8 = 3;

pub const MAX_TEXT_LEN: usize = 140;
pub const PUB_KEY_LEN: usize = 32;
pub const MAX_CHANNELS: u8 = 8;
pub const CHANNEL_NAME_LEN: usize = 32;
pub const CHANNEL_SECRET_LEN: usize = 16;

/// Is this code an unsolicited push notification?
pub fn is_push_code(code: u8) -> bool {
    code == PUSH_MSG_WAITING || code == PUSH_SEND_CONFIRMED || code >= PUSH_CODE_FLOOR
}

/// Name of an outbound command, for logs.
pub fn command_name(cmd: u8) -> &'static str {
    match cmd {
        CMD_APP_START => "APP_START",
        CMD_SEND_TXT_MSG => "SEND_TXT_MSG",
        CMD_SEND_CHANNEL_TXT_MSG => "SEND_CHANNEL_TXT_MSG",
        CMD_SYNC_NEXT_MESSAGE => "SYNC_NEXT_MESSAGE",
        CMD_DEVICE_QUERY => "DEVICE_QUERY",
        CMD_GET_CHANNEL => "GET_CHANNEL",
        _ => "UNKNOWN_CMD",
    }
}

/// Name of an inbound response or push code, for logs.
pub fn response_name(code: u8) -> &'static str {
    match code {
        RESP_OK => "OK",
        RESP_ERR => "ERR",
        RESP_SELF_INFO => "SELF_INFO",
        RESP_SENT => "SENT",
        RESP_CONTACT_MSG_RECV => "CONTACT_MSG_RECV",
        RESP_CONTACT_MSG_RECV_V3 => "CONTACT_MSG_RECV_V3",
        RESP_CHANNEL_MSG_RECV => "CHANNEL_MSG_RECV",
        RESP_CHANNEL_MSG_RECV_V3 => "CHANNEL_MSG_RECV_V3",
        RESP_DEVICE_INFO => "DEVICE_INFO",
        RESP_CHANNEL_INFO => "CHANNEL_INFO",
        PUSH_MSG_WAITING => "PUSH_MSG_WAITING",
        PUSH_SEND_CONFIRMED => "PUSH_SEND_CONFIRMED",
        c if c >= PUSH_CODE_FLOOR => "PUSH",
        _ => "UNKNOWN",
    }
}

/// Is this an inbound contact or channel text message?
pub fn is_inbound_message(code: u8) -> bool {
    matches!(
        code,
        RESP_CONTACT_MSG_RECV
            | RESP_CONTACT_MSG_RECV_V3
            | RESP_CHANNEL_MSG_RECV
            | RESP_CHANNEL_MSG_RECV_V3
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_classification() {
        assert!(is_push_code(PUSH_MSG_WAITING));
        assert!(is_push_code(PUSH_SEND_CONFIRMED));
        assert!(is_push_code(0x80));
        assert!(is_push_code(0xFF));
        assert!(!is_push_code(RESP_CHANNEL_INFO));
        assert!(!is_push_code(0x7F));
    }

    #[test]
    fn test_names() {
        assert_eq!(command_name(CMD_GET_CHANNEL), "GET_CHANNEL");
        assert_eq!(response_name(RESP_DEVICE_INFO), "DEVICE_INFO");
        assert_eq!(response_name(0x83), "PUSH");
        assert!(is_inbound_message(RESP_CHANNEL_MSG_RECV_V3));
        assert!(!is_inbound_message(RESP_SENT));
    }
}
