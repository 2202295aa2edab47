//! Server-side scripts for atomic remote-KV operations
//!
//! Each script is a named constant with fixed semantics. When the backend
//! does not offer scripting the store falls back to pipelined command
//! batches and tolerates briefly non-atomic tag maintenance.

/// Atomic GET with TTL check.
///
/// KEYS[1] = entry key. Returns the payload only while the key still has
/// time to live; a key at or past expiry reports nothing.
pub const GET_CHECK_TTL: &str = r#"
local v = redis.call('GET', KEYS[1])
if not v then
  return false
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl == -2 or ttl == 0 then
  return false
end
return v
"#;

/// Atomic SET with tag fan-out.
///
/// KEYS[1] = entry key, KEYS[2..] = tag set keys.
/// ARGV[1] = payload, ARGV[2] = entry TTL seconds, ARGV[3] = tag set TTL
/// seconds, ARGV[4] = unprefixed member key recorded in each tag set.
pub const SET_WITH_TAGS: &str = r#"
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
for i = 2, #KEYS do
  redis.call('SADD', KEYS[i], ARGV[4])
  redis.call('EXPIRE', KEYS[i], ARGV[3])
end
return 1
"#;

/// Atomic DELETE by tags with cursor-scanned tag-set cleanup.
///
/// KEYS[1..] = tag set keys.
/// ARGV[1] = entry key prefix, ARGV[2] = glob matching every tag set key.
/// Deletes the union of tagged entries, drops the listed tag sets, then
/// scans the remaining tag sets and removes the dead members.
pub const DELETE_BY_TAGS: &str = r#"
local deleted = 0
local members = {}
local seen = {}
for i = 1, #KEYS do
  for _, m in ipairs(redis.call('SMEMBERS', KEYS[i])) do
    if not seen[m] then
      seen[m] = true
      members[#members + 1] = m
    end
  end
  redis.call('DEL', KEYS[i])
end
for _, m in ipairs(members) do
  deleted = deleted + redis.call('DEL', ARGV[1] .. m)
end
local cursor = '0'
repeat
  local res = redis.call('SCAN', cursor, 'MATCH', ARGV[2], 'COUNT', 100)
  cursor = res[1]
  for _, setkey in ipairs(res[2]) do
    for _, m in ipairs(members) do
      redis.call('SREM', setkey, m)
    end
  end
until cursor == '0'
return deleted
"#;

/// DELETE by key pattern with cursor scanning.
///
/// ARGV[1] = glob over prefixed entry keys. Returns the number deleted.
pub const DELETE_BY_PATTERN: &str = r#"
local deleted = 0
local cursor = '0'
repeat
  local res = redis.call('SCAN', cursor, 'MATCH', ARGV[1], 'COUNT', 200)
  cursor = res[1]
  if #res[2] > 0 then
    deleted = deleted + redis.call('DEL', unpack(res[2]))
  end
until cursor == '0'
return deleted
"#;
