//! Server-side procedures for the Redis backend.
//!
//! Each script is one indivisible transaction on `KEYS[1]`. Time always
//! arrives as an argument in epoch milliseconds; scripts never read the
//! server clock. Mutating scripts return `{success, value[, secondary]}`.

/// ARGV: limit, interval, now. Returns `{success, remaining}`.
pub const FIXED_WINDOW_CONSUME: &str = r#"
local limit = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local window_start = math.floor(now / interval) * interval

local state = redis.call('HMGET', KEYS[1], 'count', 'window_start')
local count = 0
if state[2] and tonumber(state[2]) == window_start then
  count = tonumber(state[1]) or 0
end
count = count + 1

redis.call('HSET', KEYS[1], 'count', count, 'window_start', window_start)
redis.call('PEXPIRE', KEYS[1], window_start + interval - now)

local remaining = math.max(0, limit - count)
if count <= limit then
  return {1, remaining}
end
return {0, remaining}
"#;

/// ARGV: limit, interval, now. Returns `{success, remaining}`.
pub const SLIDING_WINDOW_CONSUME: &str = r#"
local limit = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local bucket = math.floor(now / interval) * interval

local state = redis.call('HMGET', KEYS[1], 'current', 'previous', 'window_start')
local current = tonumber(state[1]) or 0
local previous = tonumber(state[2]) or 0
local start = tonumber(state[3])

if start == nil then
  current = 0
  previous = 0
  start = bucket
elseif bucket > start then
  if bucket - start == interval then
    previous = current
  else
    previous = 0
  end
  current = 0
  start = bucket
end

local left = math.min(interval, math.max(0, start + interval - now))
local weighted = current + math.floor(previous * left / interval)

local success = 0
local remaining = 0
if weighted < limit then
  current = current + 1
  success = 1
  remaining = math.max(0, limit - (weighted + 1))
end

redis.call('HSET', KEYS[1], 'current', current, 'previous', previous, 'window_start', start)
redis.call('PEXPIRE', KEYS[1], interval * 2)
return {success, remaining}
"#;

/// ARGV: limit, interval, now, member. Returns `{success, remaining}`.
pub const SLIDING_LOG_CONSUME: &str = r#"
local limit = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - interval)
local count = redis.call('ZCARD', KEYS[1])
if count < limit then
  redis.call('ZADD', KEYS[1], now, ARGV[4])
  redis.call('PEXPIRE', KEYS[1], interval)
  return {1, math.max(0, limit - (count + 1))}
end
return {0, 0}
"#;

/// Shared refill step for the token bucket scripts. Expects `capacity`,
/// `refill_amount`, `refill_interval` and `now` locals.
macro_rules! token_bucket_refill {
    () => {
        r#"
local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
end
if now > last_refill then
  local cycles = math.floor((now - last_refill) / refill_interval)
  if cycles > 0 then
    tokens = math.min(capacity, tokens + cycles * refill_amount)
    last_refill = last_refill + cycles * refill_interval
  end
end
"#
    };
}

/// ARGV: capacity, refill_amount, refill_interval, now, requested, ttl.
/// Returns `{success, tokens, next_refill_at}`.
pub const TOKEN_BUCKET_CONSUME: &str = concat!(
    r#"
local capacity = tonumber(ARGV[1])
local refill_amount = tonumber(ARGV[2])
local refill_interval = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local requested = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])
"#,
    token_bucket_refill!(),
    r#"
local success = 0
if tokens >= requested then
  tokens = tokens - requested
  success = 1
end

redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill', last_refill)
redis.call('PEXPIRE', KEYS[1], ttl)
return {success, tokens, last_refill + refill_interval}
"#
);

/// ARGV: capacity, refill_amount, refill_interval, now, delta, ttl.
/// Applies refill, then adds the signed `delta` clamped to `[0, capacity]`.
/// Returns `{1, tokens, next_refill_at}`.
pub const TOKEN_BUCKET_ADJUST: &str = concat!(
    r#"
local capacity = tonumber(ARGV[1])
local refill_amount = tonumber(ARGV[2])
local refill_interval = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local delta = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])
"#,
    token_bucket_refill!(),
    r#"
tokens = math.max(0, math.min(capacity, tokens + delta))

redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill', last_refill)
redis.call('PEXPIRE', KEYS[1], ttl)
return {1, tokens, last_refill + refill_interval}
"#
);

/// ARGV: capacity, interval, now, member. Returns `{success, remaining}`.
pub const LEAKY_BUCKET_CONSUME: &str = r#"
local capacity = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
local size = redis.call('ZCARD', KEYS[1])
if size < capacity then
  redis.call('ZADD', KEYS[1], now + interval, ARGV[4])
  redis.call('PEXPIRE', KEYS[1], interval)
  return {1, capacity - (size + 1)}
end
return {0, 0}
"#;

/// ARGV: min_interval, now. Returns `{success, wait_time, next_allowed_at}`.
pub const THROTTLE: &str = r#"
local min_interval = tonumber(ARGV[1])
local now = tonumber(ARGV[2])

local last = tonumber(redis.call('GET', KEYS[1]))
if last == nil then
  redis.call('SET', KEYS[1], now, 'PX', min_interval)
  return {1, 0, now}
end

local elapsed = math.max(0, now - last)
if elapsed >= min_interval then
  redis.call('SET', KEYS[1], now, 'PX', min_interval)
  return {1, 0, now}
end
return {0, min_interval - elapsed, last + min_interval}
"#;
