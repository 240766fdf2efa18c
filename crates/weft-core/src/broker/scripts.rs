//! Lua sources for every atomic transition.
//!
//! Keys are passed in KEYS so the scripts stay cluster-safe; the per-queue task key
//! prefix is passed in ARGV for scripts that derive task keys from popped IDs.

/// KEYS[1] -> {p}:{q}:t:<id>
/// KEYS[2] -> {p}:{q}:pending
/// ARGV[1] -> encoded message
/// ARGV[2] -> task ID
/// ARGV[3] -> now (unix nsec)
/// ARGV[4] -> hash TTL in seconds (<= 0: no expiry)
///
/// Returns 1 on success, 0 if the task ID already exists.
pub const ENQUEUE: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return 0
end
redis.call("HSET", KEYS[1],
           "msg", ARGV[1],
           "state", "pending",
           "pending_since", ARGV[3])
if tonumber(ARGV[4]) > 0 then
    redis.call("EXPIRE", KEYS[1], ARGV[4])
end
redis.call("LPUSH", KEYS[2], ARGV[2])
return 1
"#;

/// KEYS[1] -> unique key
/// KEYS[2] -> {p}:{q}:t:<id>
/// KEYS[3] -> {p}:{q}:pending
/// ARGV[1] -> task ID
/// ARGV[2] -> uniqueness TTL in seconds
/// ARGV[3] -> encoded message
/// ARGV[4] -> now (unix nsec)
/// ARGV[5] -> hash TTL in seconds (<= 0: no expiry)
///
/// Returns 1 on success, 0 on ID conflict, -1 if the unique key is held.
pub const ENQUEUE_UNIQUE: &str = r#"
local ok = redis.call("SET", KEYS[1], ARGV[1], "NX", "EX", ARGV[2])
if not ok then
    return -1
end
if redis.call("EXISTS", KEYS[2]) == 1 then
    return 0
end
redis.call("HSET", KEYS[2],
           "msg", ARGV[3],
           "state", "pending",
           "pending_since", ARGV[4],
           "unique_key", KEYS[1])
if tonumber(ARGV[5]) > 0 then
    redis.call("EXPIRE", KEYS[2], ARGV[5])
end
redis.call("LPUSH", KEYS[3], ARGV[1])
return 1
"#;

/// KEYS[1] -> {p}:{q}:pending
/// KEYS[2] -> {p}:{q}:paused
/// KEYS[3] -> {p}:{q}:active
/// KEYS[4] -> {p}:{q}:lease
/// ARGV[1] -> lease expiration (unix sec)
/// ARGV[2] -> task key prefix
///
/// Returns the encoded message, or nil if the queue is paused or empty.
/// IDs whose hash has already expired are dropped on the way.
pub const DEQUEUE: &str = r#"
if redis.call("EXISTS", KEYS[2]) == 1 then
    return nil
end
while true do
    local id = redis.call("RPOPLPUSH", KEYS[1], KEYS[3])
    if not id then
        return nil
    end
    local key = ARGV[2] .. id
    local msg = redis.call("HGET", key, "msg")
    if msg then
        redis.call("PERSIST", key)
        redis.call("HSET", key, "state", "active")
        redis.call("HDEL", key, "pending_since")
        redis.call("ZADD", KEYS[4], ARGV[1], id)
        return msg
    end
    redis.call("LREM", KEYS[3], 0, id)
end
"#;

/// KEYS[1] -> {p}:{q}:active
/// KEYS[2] -> {p}:{q}:lease
/// KEYS[3] -> {p}:{q}:t:<id>
/// KEYS[4] -> {p}:{q}:processed:<date>
/// KEYS[5] -> {p}:{q}:processed
/// KEYS[6] -> unique key (optional)
/// ARGV[1] -> task ID
/// ARGV[2] -> stats expiration (unix sec)
/// ARGV[3] -> max int64
pub const DONE: &str = r#"
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
    return redis.error_reply("NOTFOUND")
end
if redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
    return redis.error_reply("NOTFOUND")
end
if redis.call("DEL", KEYS[3]) == 0 then
    return redis.error_reply("NOTFOUND")
end
local n = redis.call("INCR", KEYS[4])
if tonumber(n) == 1 then
    redis.call("EXPIREAT", KEYS[4], ARGV[2])
end
local total = redis.call("GET", KEYS[5])
if tonumber(total) == tonumber(ARGV[3]) then
    redis.call("SET", KEYS[5], 1)
else
    redis.call("INCR", KEYS[5])
end
if KEYS[6] and redis.call("GET", KEYS[6]) == ARGV[1] then
    redis.call("DEL", KEYS[6])
end
return redis.status_reply("OK")
"#;

/// KEYS[1] -> {p}:{q}:active
/// KEYS[2] -> {p}:{q}:lease
/// KEYS[3] -> {p}:{q}:completed
/// KEYS[4] -> {p}:{q}:t:<id>
/// KEYS[5] -> {p}:{q}:processed:<date>
/// KEYS[6] -> {p}:{q}:processed
/// KEYS[7] -> unique key (optional)
/// ARGV[1] -> task ID
/// ARGV[2] -> stats expiration (unix sec)
/// ARGV[3] -> completed record expiration (unix sec)
/// ARGV[4] -> encoded message
/// ARGV[5] -> max int64
pub const MARK_AS_COMPLETE: &str = r#"
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
    return redis.error_reply("NOTFOUND")
end
if redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
    return redis.error_reply("NOTFOUND")
end
if redis.call("ZADD", KEYS[3], ARGV[3], ARGV[1]) ~= 1 then
    return redis.error_reply("INTERNAL")
end
redis.call("HSET", KEYS[4], "msg", ARGV[4], "state", "completed")
local n = redis.call("INCR", KEYS[5])
if tonumber(n) == 1 then
    redis.call("EXPIREAT", KEYS[5], ARGV[2])
end
local total = redis.call("GET", KEYS[6])
if tonumber(total) == tonumber(ARGV[5]) then
    redis.call("SET", KEYS[6], 1)
else
    redis.call("INCR", KEYS[6])
end
if KEYS[7] and redis.call("GET", KEYS[7]) == ARGV[1] then
    redis.call("DEL", KEYS[7])
end
return redis.status_reply("OK")
"#;

/// KEYS[1] -> {p}:{q}:active
/// KEYS[2] -> {p}:{q}:lease
/// KEYS[3] -> {p}:{q}:pending
/// KEYS[4] -> {p}:{q}:t:<id>
/// ARGV[1] -> task ID
///
/// RPUSH puts the task at the head, so it is the next one dequeued.
pub const REQUEUE: &str = r#"
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
    return redis.error_reply("NOTFOUND")
end
if redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
    return redis.error_reply("NOTFOUND")
end
redis.call("RPUSH", KEYS[3], ARGV[1])
redis.call("HSET", KEYS[4], "state", "pending")
return redis.status_reply("OK")
"#;

/// KEYS[1] -> {p}:{q}:t:<id>
/// KEYS[2] -> {p}:{q}:scheduled
/// ARGV[1] -> encoded message
/// ARGV[2] -> process_at (unix sec)
/// ARGV[3] -> task ID
///
/// Returns 1 on success, 0 if the task ID already exists.
pub const SCHEDULE: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return 0
end
redis.call("HSET", KEYS[1],
           "msg", ARGV[1],
           "state", "scheduled")
redis.call("ZADD", KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

/// KEYS[1] -> unique key
/// KEYS[2] -> {p}:{q}:t:<id>
/// KEYS[3] -> {p}:{q}:scheduled
/// ARGV[1] -> task ID
/// ARGV[2] -> uniqueness TTL in seconds
/// ARGV[3] -> process_at (unix sec)
/// ARGV[4] -> encoded message
///
/// Returns 1 on success, 0 on ID conflict, -1 if the unique key is held.
pub const SCHEDULE_UNIQUE: &str = r#"
local ok = redis.call("SET", KEYS[1], ARGV[1], "NX", "EX", ARGV[2])
if not ok then
    return -1
end
if redis.call("EXISTS", KEYS[2]) == 1 then
    return 0
end
redis.call("HSET", KEYS[2],
           "msg", ARGV[4],
           "state", "scheduled",
           "unique_key", KEYS[1])
redis.call("ZADD", KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

/// KEYS[1] -> {p}:{q}:t:<id>
/// KEYS[2] -> {p}:{q}:active
/// KEYS[3] -> {p}:{q}:lease
/// KEYS[4] -> {p}:{q}:retry
/// KEYS[5] -> {p}:{q}:processed:<date>
/// KEYS[6] -> {p}:{q}:failed:<date>
/// KEYS[7] -> {p}:{q}:processed
/// KEYS[8] -> {p}:{q}:failed
/// ARGV[1] -> task ID
/// ARGV[2] -> updated encoded message
/// ARGV[3] -> retry_at (unix sec)
/// ARGV[4] -> stats expiration (unix sec)
/// ARGV[5] -> is_failure (0 / 1)
/// ARGV[6] -> max int64
pub const RETRY: &str = r#"
if redis.call("LREM", KEYS[2], 0, ARGV[1]) == 0 then
    return redis.error_reply("NOTFOUND")
end
if redis.call("ZREM", KEYS[3], ARGV[1]) == 0 then
    return redis.error_reply("NOTFOUND")
end
redis.call("ZADD", KEYS[4], ARGV[3], ARGV[1])
redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", "retry")
if tonumber(ARGV[5]) == 1 then
    local n = redis.call("INCR", KEYS[5])
    if tonumber(n) == 1 then
        redis.call("EXPIREAT", KEYS[5], ARGV[4])
    end
    local m = redis.call("INCR", KEYS[6])
    if tonumber(m) == 1 then
        redis.call("EXPIREAT", KEYS[6], ARGV[4])
    end
    local total = redis.call("GET", KEYS[7])
    if tonumber(total) == tonumber(ARGV[6]) then
        redis.call("SET", KEYS[7], 1)
        redis.call("SET", KEYS[8], 1)
    else
        redis.call("INCR", KEYS[7])
        redis.call("INCR", KEYS[8])
    end
end
return redis.status_reply("OK")
"#;

/// KEYS[1] -> {p}:{q}:t:<id>
/// KEYS[2] -> {p}:{q}:active
/// KEYS[3] -> {p}:{q}:lease
/// KEYS[4] -> {p}:{q}:archived
/// KEYS[5] -> {p}:{q}:processed:<date>
/// KEYS[6] -> {p}:{q}:failed:<date>
/// KEYS[7] -> {p}:{q}:processed
/// KEYS[8] -> {p}:{q}:failed
/// ARGV[1] -> task ID
/// ARGV[2] -> died_at (unix sec)
/// ARGV[3] -> age cutoff (unix sec)
/// ARGV[4] -> max archive size
/// ARGV[5] -> stats expiration (unix sec)
/// ARGV[6] -> max int64
pub const ARCHIVE: &str = r#"
if redis.call("LREM", KEYS[2], 0, ARGV[1]) == 0 then
    return redis.error_reply("NOTFOUND")
end
if redis.call("ZREM", KEYS[3], ARGV[1]) == 0 then
    return redis.error_reply("NOTFOUND")
end
redis.call("ZADD", KEYS[4], ARGV[2], ARGV[1])
redis.call("ZREMRANGEBYSCORE", KEYS[4], "-inf", ARGV[3])
redis.call("ZREMRANGEBYRANK", KEYS[4], 0, -tonumber(ARGV[4]))
redis.call("DEL", KEYS[1])
local n = redis.call("INCR", KEYS[5])
if tonumber(n) == 1 then
    redis.call("EXPIREAT", KEYS[5], ARGV[5])
end
local m = redis.call("INCR", KEYS[6])
if tonumber(m) == 1 then
    redis.call("EXPIREAT", KEYS[6], ARGV[5])
end
local total = redis.call("GET", KEYS[7])
if tonumber(total) == tonumber(ARGV[6]) then
    redis.call("SET", KEYS[7], 1)
    redis.call("SET", KEYS[8], 1)
else
    redis.call("INCR", KEYS[7])
    redis.call("INCR", KEYS[8])
end
return redis.status_reply("OK")
"#;

/// KEYS[1] -> {p}:{q}:scheduled or {p}:{q}:retry
/// KEYS[2] -> {p}:{q}:pending
/// ARGV[1] -> now (unix sec)
/// ARGV[2] -> task key prefix
/// ARGV[3] -> now (unix nsec)
/// ARGV[4] -> batch size
///
/// Returns the number of tasks moved.
pub const FORWARD: &str = r#"
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[4]))
for _, id in ipairs(ids) do
    redis.call("LPUSH", KEYS[2], id)
    redis.call("ZREM", KEYS[1], id)
    redis.call("HSET", ARGV[2] .. id,
               "state", "pending",
               "pending_since", ARGV[3])
end
return #ids
"#;

/// KEYS[1] -> {p}:{q}:completed
/// ARGV[1] -> now (unix sec)
/// ARGV[2] -> task key prefix
/// ARGV[3] -> batch size
///
/// Returns the number of tasks deleted.
pub const DELETE_EXPIRED_COMPLETED: &str = r#"
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[3]))
for _, id in ipairs(ids) do
    redis.call("DEL", ARGV[2] .. id)
    redis.call("ZREM", KEYS[1], id)
end
return #ids
"#;

/// KEYS[1] -> {p}:{q}:lease
/// ARGV[1] -> cutoff (unix sec)
/// ARGV[2] -> task key prefix
pub const LIST_LEASE_EXPIRED: &str = r#"
local res = {}
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
for _, id in ipairs(ids) do
    local msg = redis.call("HGET", ARGV[2] .. id, "msg")
    if msg then
        table.insert(res, msg)
    end
end
return res
"#;

/// KEYS[1] -> <p>:servers:{host:pid:sid}
/// KEYS[2] -> <p>:workers:{host:pid:sid}
/// ARGV[1] -> TTL in seconds
/// ARGV[2] -> encoded server info
/// ARGV[3:] -> (worker ID, encoded worker info) pairs
pub const WRITE_SERVER_STATE: &str = r#"
redis.call("SETEX", KEYS[1], ARGV[1], ARGV[2])
redis.call("DEL", KEYS[2])
for i = 3, #ARGV - 1, 2 do
    redis.call("HSET", KEYS[2], ARGV[i], ARGV[i + 1])
end
redis.call("EXPIRE", KEYS[2], ARGV[1])
return redis.status_reply("OK")
"#;

/// KEYS[1] -> <p>:servers:{host:pid:sid}
/// KEYS[2] -> <p>:workers:{host:pid:sid}
pub const CLEAR_SERVER_STATE: &str = r#"
redis.call("DEL", KEYS[1])
redis.call("DEL", KEYS[2])
return redis.status_reply("OK")
"#;

/// KEYS[1] -> <p>:schedulers:{id}
/// ARGV[1] -> TTL in seconds
/// ARGV[2:] -> encoded scheduler entries
pub const WRITE_SCHEDULER_ENTRIES: &str = r#"
redis.call("DEL", KEYS[1])
for i = 2, #ARGV do
    redis.call("LPUSH", KEYS[1], ARGV[i])
end
redis.call("EXPIRE", KEYS[1], ARGV[1])
return redis.status_reply("OK")
"#;

/// KEYS[1] -> <p>:scheduler_history:<entry ID>
/// ARGV[1] -> enqueued_at (unix sec)
/// ARGV[2] -> encoded event
/// ARGV[3] -> max events kept
pub const RECORD_SCHEDULER_ENQUEUE_EVENT: &str = r#"
redis.call("ZREMRANGEBYRANK", KEYS[1], 0, -tonumber(ARGV[3]))
redis.call("ZADD", KEYS[1], ARGV[1], ARGV[2])
return redis.status_reply("OK")
"#;

/// KEYS[1] -> {p}:{q}:t:<id>
/// ARGV[1] -> result bytes
///
/// Returns the number of bytes written. Never creates a hash for an unknown task.
pub const WRITE_RESULT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
    return redis.error_reply("NOTFOUND")
end
redis.call("HSET", KEYS[1], "result", ARGV[1])
return string.len(ARGV[1])
"#;
