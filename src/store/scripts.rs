//! Server-side scripts for record operations on the distributed store.
//!
//! Records are stored as JSON strings. Each script is one atomic unit on the
//! server, so a client that times out waiting for the reply never leaves a
//! half-applied record behind.

/// Install a candidate record unless a live one exists.
///
/// KEYS[1] record key. ARGV: candidate JSON, PX ttl, now_ms.
/// Returns `{created, record_json}`.
pub(crate) const GET_OR_CREATE: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
  local ok, record = pcall(cjson.decode, current)
  if ok and type(record) == 'table' and tonumber(record.expires_at) > tonumber(ARGV[3]) then
    record.access_count = (tonumber(record.access_count) or 0) + 1
    local encoded = cjson.encode(record)
    redis.call('SET', KEYS[1], encoded, 'KEEPTTL')
    return {0, encoded}
  end
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return {1, ARGV[1]}
"#;

/// Apply a `RecordUpdate` to a live record.
///
/// KEYS[1] record key. ARGV: update JSON, now_ms, ttl buffer ms.
/// Returns nil when no live record exists, else `{applied, record_json}`.
pub(crate) const COMPARE_AND_UPDATE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return false
end
local ok, record = pcall(cjson.decode, current)
local now = tonumber(ARGV[2])
if not ok or type(record) ~= 'table' or tonumber(record.expires_at) <= now then
  return false
end
local update = cjson.decode(ARGV[1])
local applied = 0
if update.op == 'complete' and record.status == 'EXECUTING' then
  record.status = 'SUCCESS'
  record.payload = update.payload
  record.error = cjson.null
  applied = 1
elseif update.op == 'fail' and record.status == 'EXECUTING' then
  record.status = 'FAILED'
  record.error = update.error
  applied = 1
elseif update.op == 'restart' and record.status == 'FAILED' then
  record.status = 'EXECUTING'
  record.created_at = now
  record.expires_at = tonumber(update.expires_at)
  record.payload = cjson.null
  record.error = cjson.null
  applied = 1
end
if applied == 0 then
  return {0, current}
end
local encoded = cjson.encode(record)
if update.op == 'restart' then
  redis.call('SET', KEYS[1], encoded, 'PX', (record.expires_at - now) + tonumber(ARGV[3]))
else
  redis.call('SET', KEYS[1], encoded, 'KEEPTTL')
end
return {1, encoded}
"#;

/// Whether a live entry exists. Record values past their logical expiry
/// count as absent; window state of any type counts as present.
///
/// KEYS[1] key. ARGV: now_ms. Returns 0 or 1.
pub(crate) const EXISTS_LIVE: &str = r#"
local kind = redis.call('TYPE', KEYS[1]).ok
if kind == 'none' then
  return 0
end
if kind ~= 'string' then
  return 1
end
local ok, record = pcall(cjson.decode, redis.call('GET', KEYS[1]))
if ok and type(record) == 'table' and record.expires_at and tonumber(record.expires_at) <= tonumber(ARGV[1]) then
  return 0
end
return 1
"#;

/// Read a record, treating logically expired values as absent.
///
/// KEYS[1] record key. ARGV: now_ms. Returns nil or the record JSON.
pub(crate) const GET_LIVE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return false
end
local ok, record = pcall(cjson.decode, current)
if not ok or type(record) ~= 'table' or tonumber(record.expires_at) <= tonumber(ARGV[1]) then
  return false
end
return current
"#;
