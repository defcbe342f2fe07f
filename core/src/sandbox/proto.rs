//! gRPC-web 帧与 protobuf 线格式的手工编解码。
//!
//! 个别插件的后端走类型化 RPC（gRPC-web + protobuf）。这里只支持固定的
//! 请求/响应消息集合，解码是防御式的：未知/改号的字段按线类型跳过，
//! 截断的输入返回已解出的部分，绝不因此崩溃。

use serde_json::{json, Value};

// 线类型
const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

// ------------------------------------------------------------------
// gRPC-web 帧
// ------------------------------------------------------------------

/// 5 字节头（flag + 大端长度）+ 消息体
pub fn frame_grpc_web_message(message: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(5 + message.len());
    framed.push(0);
    framed.extend_from_slice(&(message.len() as u32).to_be_bytes());
    framed.extend_from_slice(message);
    framed
}

/// 取第一个数据帧的消息体；trailer 帧（flag 高位置位）跳过
pub fn extract_grpc_web_payload(body: &[u8]) -> Vec<u8> {
    let mut offset = 0usize;
    while offset + 5 <= body.len() {
        let flag = body[offset];
        let len = u32::from_be_bytes([
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
            body[offset + 4],
        ]) as usize;
        let start = offset + 5;
        let Some(end) = start.checked_add(len) else {
            break;
        };
        if end > body.len() {
            break;
        }
        if flag & 0x80 == 0 {
            return body[start..end].to_vec();
        }
        offset = end;
    }
    Vec::new()
}

// ------------------------------------------------------------------
// 编码
// ------------------------------------------------------------------

#[derive(Default)]
struct ProtoWriter {
    buf: Vec<u8>,
}

impl ProtoWriter {
    fn write_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
    }

    fn write_tag(&mut self, field: u32, wire: u8) {
        self.write_varint(((field as u64) << 3) | wire as u64);
    }

    fn write_int(&mut self, field: u32, value: i64) {
        self.write_tag(field, WIRE_VARINT);
        self.write_varint(value as u64);
    }

    fn write_string(&mut self, field: u32, value: &str) {
        self.write_tag(field, WIRE_LEN);
        self.write_varint(value.len() as u64);
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn write_message(&mut self, field: u32, message: &[u8]) {
        self.write_tag(field, WIRE_LEN);
        self.write_varint(message.len() as u64);
        self.buf.extend_from_slice(message);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// 按请求类型编码 `requestData`
pub fn encode_request(request_type: &str, data: &Value) -> Result<Vec<u8>, String> {
    match request_type {
        "GetNovelRequest" => {
            let slug = data
                .get("slug")
                .and_then(|v| v.as_str())
                .ok_or("Missing slug for GetNovelRequest")?;
            let mut w = ProtoWriter::default();
            w.write_string(2, slug);
            Ok(w.into_bytes())
        }
        "GetChapterListRequest" => {
            let novel_id = data
                .get("novelId")
                .and_then(|v| v.as_i64())
                .ok_or("Missing novelId for GetChapterListRequest")?;
            let mut w = ProtoWriter::default();
            w.write_int(1, novel_id);
            Ok(w.into_bytes())
        }
        "GetChapterRequest" => {
            let slugs = data
                .get("chapterProperty")
                .and_then(|v| v.get("slugs"))
                .ok_or("Missing chapterProperty.slugs for GetChapterRequest")?;
            let novel_slug = slugs
                .get("novelSlug")
                .and_then(|v| v.as_str())
                .ok_or("Missing chapterProperty.slugs.novelSlug")?;
            let chapter_slug = slugs
                .get("chapterSlug")
                .and_then(|v| v.as_str())
                .ok_or("Missing chapterProperty.slugs.chapterSlug")?;

            let mut slugs_msg = ProtoWriter::default();
            slugs_msg.write_string(1, novel_slug);
            slugs_msg.write_string(2, chapter_slug);

            let mut property_msg = ProtoWriter::default();
            property_msg.write_message(2, &slugs_msg.into_bytes());

            let mut w = ProtoWriter::default();
            w.write_message(1, &property_msg.into_bytes());
            Ok(w.into_bytes())
        }
        other => Err(format!("Unsupported proto request type: {}", other)),
    }
}

// ------------------------------------------------------------------
// 解码
// ------------------------------------------------------------------

struct ProtoReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ProtoReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_varint(&mut self) -> Option<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self.buf.get(self.pos)?;
            self.pos += 1;
            if shift < 64 {
                value |= u64::from(byte & 0x7f) << shift;
            }
            if byte & 0x80 == 0 {
                return Some(value);
            }
            shift += 7;
            if shift > 63 {
                return None;
            }
        }
    }

    fn read_tag(&mut self) -> Option<(u32, u8)> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let tag = self.read_varint()?;
        let field = (tag >> 3) as u32;
        let wire = (tag & 0x7) as u8;
        if field == 0 {
            return None;
        }
        Some((field, wire))
    }

    fn read_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.read_varint()? as usize;
        let start = self.pos;
        let end = start.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        self.pos = end;
        Some(&self.buf[start..end])
    }

    fn read_fixed32(&mut self) -> Option<u32> {
        let end = self.pos.checked_add(4)?;
        if end > self.buf.len() {
            return None;
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Some(u32::from_le_bytes(bytes))
    }

    fn skip(&mut self, wire: u8) -> bool {
        match wire {
            WIRE_VARINT => self.read_varint().is_some(),
            WIRE_FIXED64 => {
                let end = match self.pos.checked_add(8) {
                    Some(e) => e,
                    None => return false,
                };
                if end > self.buf.len() {
                    return false;
                }
                self.pos = end;
                true
            }
            WIRE_LEN => self.read_bytes().is_some(),
            WIRE_FIXED32 => self.read_fixed32().is_some(),
            _ => false,
        }
    }
}

fn decode_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// `StringValue { 1: value }`
fn decode_string_value(bytes: &[u8]) -> Value {
    let mut r = ProtoReader::new(bytes);
    let mut value = Value::Null;
    while let Some((field, wire)) = r.read_tag() {
        match (field, wire) {
            (1, WIRE_LEN) => match r.read_bytes() {
                Some(b) => value = Value::String(decode_string(b)),
                None => break,
            },
            _ => {
                if !r.skip(wire) {
                    break;
                }
            }
        }
    }
    json!({ "value": value })
}

/// `BoolValue { 1: value }`
fn decode_bool_value(bytes: &[u8]) -> Value {
    let mut r = ProtoReader::new(bytes);
    let mut value = Value::Null;
    while let Some((field, wire)) = r.read_tag() {
        match (field, wire) {
            (1, WIRE_VARINT) => match r.read_varint() {
                Some(v) => value = Value::Bool(v != 0),
                None => break,
            },
            _ => {
                if !r.skip(wire) {
                    break;
                }
            }
        }
    }
    json!({ "value": value })
}

/// `DecimalValue { 1: units(varint), 2: nanos(fixed32) }`
fn decode_decimal_value(bytes: &[u8]) -> Value {
    let mut r = ProtoReader::new(bytes);
    let mut units = Value::Null;
    let mut nanos = Value::Null;
    while let Some((field, wire)) = r.read_tag() {
        match (field, wire) {
            (1, WIRE_VARINT) => match r.read_varint() {
                Some(v) => units = json!(v as i64),
                None => break,
            },
            (2, WIRE_FIXED32) => match r.read_fixed32() {
                Some(v) => nanos = json!(v as i32),
                None => break,
            },
            _ => {
                if !r.skip(wire) {
                    break;
                }
            }
        }
    }
    json!({ "units": units, "nanos": nanos })
}

/// `Timestamp { 1: seconds, 2: nanos }`
fn decode_timestamp(bytes: &[u8]) -> Value {
    let mut r = ProtoReader::new(bytes);
    let mut seconds = Value::Null;
    let mut nanos = Value::Null;
    while let Some((field, wire)) = r.read_tag() {
        match (field, wire) {
            (1, WIRE_VARINT) => match r.read_varint() {
                Some(v) => seconds = json!(v as i64),
                None => break,
            },
            (2, WIRE_VARINT) => match r.read_varint() {
                Some(v) => nanos = json!(v as i64),
                None => break,
            },
            _ => {
                if !r.skip(wire) {
                    break;
                }
            }
        }
    }
    json!({ "seconds": seconds, "nanos": nanos })
}

/// `KarmaInfo { 3: maxFreeChapter(Decimal) }`
fn decode_karma_info(bytes: &[u8]) -> Value {
    let mut r = ProtoReader::new(bytes);
    let mut max_free_chapter = Value::Null;
    while let Some((field, wire)) = r.read_tag() {
        match (field, wire) {
            (3, WIRE_LEN) => match r.read_bytes() {
                Some(b) => max_free_chapter = decode_decimal_value(b),
                None => break,
            },
            _ => {
                if !r.skip(wire) {
                    break;
                }
            }
        }
    }
    json!({ "maxFreeChapter": max_free_chapter })
}

fn decode_novel_item(bytes: &[u8]) -> Value {
    let mut r = ProtoReader::new(bytes);
    let mut item = json!({
        "id": Value::Null,
        "name": Value::Null,
        "slug": Value::Null,
        "status": Value::Null,
        "description": Value::Null,
        "synopsis": Value::Null,
        "coverUrl": Value::Null,
        "authorName": Value::Null,
        "karmaInfo": Value::Null,
        "genres": [],
    });
    while let Some((field, wire)) = r.read_tag() {
        match (field, wire) {
            (1, WIRE_VARINT) => match r.read_varint() {
                Some(v) => item["id"] = json!(v as i64),
                None => break,
            },
            (4, WIRE_VARINT) => match r.read_varint() {
                Some(v) => item["status"] = json!(v as i64),
                None => break,
            },
            (2, WIRE_LEN) | (3, WIRE_LEN) => match r.read_bytes() {
                Some(b) => {
                    let key = if field == 2 { "name" } else { "slug" };
                    item[key] = Value::String(decode_string(b));
                }
                None => break,
            },
            (8, WIRE_LEN) | (9, WIRE_LEN) | (10, WIRE_LEN) | (13, WIRE_LEN) => {
                match r.read_bytes() {
                    Some(b) => {
                        let key = match field {
                            8 => "description",
                            9 => "synopsis",
                            10 => "coverUrl",
                            _ => "authorName",
                        };
                        item[key] = decode_string_value(b);
                    }
                    None => break,
                }
            }
            // karmaInfo 子消息解不出来就丢弃，不让整条记录失败
            (14, WIRE_LEN) => match r.read_bytes() {
                Some(b) => item["karmaInfo"] = decode_karma_info(b),
                None => break,
            },
            (16, WIRE_LEN) => match r.read_bytes() {
                Some(b) => {
                    if let Some(genres) = item["genres"].as_array_mut() {
                        genres.push(Value::String(decode_string(b)));
                    }
                }
                None => break,
            },
            _ => {
                if !r.skip(wire) {
                    break;
                }
            }
        }
    }
    item
}

fn decode_chapter_item(bytes: &[u8]) -> Value {
    let mut r = ProtoReader::new(bytes);
    let mut item = json!({
        "name": Value::Null,
        "slug": Value::Null,
        "number": Value::Null,
        "content": Value::Null,
        "relatedUserInfo": Value::Null,
        "offset": Value::Null,
        "publishedAt": Value::Null,
    });
    while let Some((field, wire)) = r.read_tag() {
        match (field, wire) {
            (2, WIRE_LEN) | (3, WIRE_LEN) => match r.read_bytes() {
                Some(b) => {
                    let key = if field == 2 { "name" } else { "slug" };
                    item[key] = Value::String(decode_string(b));
                }
                None => break,
            },
            (4, WIRE_LEN) => match r.read_bytes() {
                Some(b) => item["number"] = decode_decimal_value(b),
                None => break,
            },
            (5, WIRE_LEN) => match r.read_bytes() {
                Some(b) => item["content"] = decode_string_value(b),
                None => break,
            },
            (16, WIRE_LEN) => match r.read_bytes() {
                Some(b) => {
                    let mut inner = ProtoReader::new(b);
                    let mut unlocked = Value::Null;
                    while let Some((f, w)) = inner.read_tag() {
                        match (f, w) {
                            (1, WIRE_LEN) => match inner.read_bytes() {
                                Some(bv) => unlocked = decode_bool_value(bv),
                                None => break,
                            },
                            _ => {
                                if !inner.skip(w) {
                                    break;
                                }
                            }
                        }
                    }
                    item["relatedUserInfo"] = json!({ "isChapterUnlocked": unlocked });
                }
                None => break,
            },
            (17, WIRE_VARINT) => match r.read_varint() {
                Some(v) => item["offset"] = json!(v as i64),
                None => break,
            },
            (18, WIRE_LEN) => match r.read_bytes() {
                Some(b) => item["publishedAt"] = decode_timestamp(b),
                None => break,
            },
            _ => {
                if !r.skip(wire) {
                    break;
                }
            }
        }
    }
    item
}

/// `ChapterGroup { 2: title, 6: chapterList(repeated) }`
fn decode_chapter_group(bytes: &[u8]) -> Value {
    let mut r = ProtoReader::new(bytes);
    let mut group = json!({ "title": Value::Null, "chapterList": [] });
    while let Some((field, wire)) = r.read_tag() {
        match (field, wire) {
            (2, WIRE_LEN) => match r.read_bytes() {
                Some(b) => group["title"] = Value::String(decode_string(b)),
                None => break,
            },
            (6, WIRE_LEN) => match r.read_bytes() {
                Some(b) => {
                    if let Some(list) = group["chapterList"].as_array_mut() {
                        list.push(decode_chapter_item(b));
                    }
                }
                None => break,
            },
            _ => {
                if !r.skip(wire) {
                    break;
                }
            }
        }
    }
    group
}

/// 按响应类型解码（空载荷返回空对象，与“无结果”同义）
pub fn decode_response(response_type: &str, payload: &[u8]) -> Result<Value, String> {
    match response_type {
        "GetNovelResponse" => {
            let mut r = ProtoReader::new(payload);
            let mut item = Value::Null;
            while let Some((field, wire)) = r.read_tag() {
                match (field, wire) {
                    (1, WIRE_LEN) => match r.read_bytes() {
                        Some(b) => item = decode_novel_item(b),
                        None => break,
                    },
                    _ => {
                        if !r.skip(wire) {
                            break;
                        }
                    }
                }
            }
            Ok(json!({ "item": item }))
        }
        "GetChapterListResponse" => {
            let mut r = ProtoReader::new(payload);
            let mut items = Vec::new();
            while let Some((field, wire)) = r.read_tag() {
                match (field, wire) {
                    (1, WIRE_LEN) => match r.read_bytes() {
                        Some(b) => items.push(decode_chapter_group(b)),
                        None => break,
                    },
                    _ => {
                        if !r.skip(wire) {
                            break;
                        }
                    }
                }
            }
            Ok(json!({ "items": items }))
        }
        "GetChapterResponse" => {
            let mut r = ProtoReader::new(payload);
            let mut item = Value::Null;
            while let Some((field, wire)) = r.read_tag() {
                match (field, wire) {
                    (1, WIRE_LEN) => match r.read_bytes() {
                        Some(b) => item = decode_chapter_item(b),
                        None => break,
                    },
                    _ => {
                        if !r.skip(wire) {
                            break;
                        }
                    }
                }
            }
            Ok(json!({ "item": item }))
        }
        other => Err(format!("Unsupported proto response type: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip_skips_trailer() {
        let framed = frame_grpc_web_message(b"hello");
        assert_eq!(framed[0], 0);
        assert_eq!(&framed[5..], b"hello");

        // trailer 帧在前：flag 0x80 的帧应被跳过
        let mut body = Vec::new();
        body.push(0x80);
        body.extend_from_slice(&3u32.to_be_bytes());
        body.extend_from_slice(b"xxx");
        body.extend_from_slice(&framed);
        assert_eq!(extract_grpc_web_payload(&body), b"hello");

        // 截断的帧返回空
        assert!(extract_grpc_web_payload(&framed[..4]).is_empty());
    }

    #[test]
    fn test_encode_get_novel_request() {
        let bytes = encode_request("GetNovelRequest", &json!({ "slug": "abc" })).unwrap();
        // field 2, wire 2, len 3, "abc"
        assert_eq!(bytes, vec![0x12, 0x03, b'a', b'b', b'c']);

        assert!(encode_request("GetNovelRequest", &json!({})).is_err());
        assert!(encode_request("Nope", &json!({})).is_err());
    }

    #[test]
    fn test_encode_chapter_request_nesting() {
        let data = json!({
            "chapterProperty": { "slugs": { "novelSlug": "n", "chapterSlug": "c" } }
        });
        let bytes = encode_request("GetChapterRequest", &data).unwrap();
        // outer: field1 msg { field2 msg { 1:"n", 2:"c" } }
        assert_eq!(
            bytes,
            vec![0x0a, 0x08, 0x12, 0x06, 0x0a, 0x01, b'n', 0x12, 0x01, b'c']
        );
    }

    #[test]
    fn test_decode_drops_unknown_fields() {
        // item: id=7 (field1 varint), name="N" (field2), 未知 field 99 (varint)
        let mut item = ProtoWriter::default();
        item.write_int(1, 7);
        item.write_string(2, "N");
        item.write_int(99, 123456);
        let mut outer = ProtoWriter::default();
        outer.write_message(1, &item.into_bytes());

        let decoded = decode_response("GetNovelResponse", &outer.into_bytes()).unwrap();
        assert_eq!(decoded["item"]["id"], json!(7));
        assert_eq!(decoded["item"]["name"], json!("N"));
        assert!(decoded["item"].get("99").is_none());
    }

    #[test]
    fn test_decode_nested_wrappers() {
        let mut desc = ProtoWriter::default();
        desc.write_string(1, "about");
        let mut item = ProtoWriter::default();
        item.write_string(3, "slug-1");
        item.write_message(8, &desc.into_bytes());
        item.write_string(16, "fantasy");
        item.write_string(16, "action");
        let mut outer = ProtoWriter::default();
        outer.write_message(1, &item.into_bytes());

        let decoded = decode_response("GetNovelResponse", &outer.into_bytes()).unwrap();
        assert_eq!(decoded["item"]["description"]["value"], json!("about"));
        assert_eq!(decoded["item"]["genres"], json!(["fantasy", "action"]));
    }

    #[test]
    fn test_decode_truncated_input_is_defensive() {
        let mut item = ProtoWriter::default();
        item.write_int(1, 7);
        item.write_string(2, "N");
        let mut outer = ProtoWriter::default();
        outer.write_message(1, &item.into_bytes());
        let bytes = outer.into_bytes();

        // 任意截断都不 panic
        for cut in 0..bytes.len() {
            let _ = decode_response("GetNovelResponse", &bytes[..cut]).unwrap();
        }
        let empty = decode_response("GetChapterListResponse", &[]).unwrap();
        assert_eq!(empty["items"], json!([]));
    }

    #[test]
    fn test_decode_chapter_list_groups() {
        let mut ch = ProtoWriter::default();
        ch.write_string(2, "Chapter 1");
        ch.write_string(3, "c-1");
        let mut group = ProtoWriter::default();
        group.write_string(2, "Volume 1");
        group.write_message(6, &ch.into_bytes());
        let mut outer = ProtoWriter::default();
        outer.write_message(1, &group.into_bytes());

        let decoded = decode_response("GetChapterListResponse", &outer.into_bytes()).unwrap();
        assert_eq!(decoded["items"][0]["title"], json!("Volume 1"));
        assert_eq!(
            decoded["items"][0]["chapterList"][0]["name"],
            json!("Chapter 1")
        );
    }
}
