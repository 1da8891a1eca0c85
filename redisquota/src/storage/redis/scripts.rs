// Redis Lua scripts. Ref: https://redis.io/commands/eval
//
// Redis runs a script atomically, so the read of the current usage and the
// increment cannot interleave with another caller's. They also guarantee
// that keys do not expire in the middle of the script, which a MULTI/EXEC
// does not.
//
// The decision scripts return {allowed (1 or 0), granted, remaining}.

// KEYS[1]: counter key of the current window
// ARGV[1]: max amount
// ARGV[2]: requested amount
// ARGV[3]: TTL of the counter in ms, until the end of the window
// ARGV[4]: best effort (1 or 0)
pub const SCRIPT_FIXED_WINDOW: &str = "
    local used = tonumber(redis.call('get', KEYS[1]) or '0')
    local available = math.max(tonumber(ARGV[1]) - used, 0)
    local amount = tonumber(ARGV[2])
    if amount > available then
        if ARGV[4] == '1' and available > 0 then
            amount = available
        else
            return {0, 0, available}
        end
    end
    if amount > 0 then
        if redis.call('incrby', KEYS[1], amount) == amount then
            redis.call('pexpire', KEYS[1], ARGV[3])
        end
    end
    return {1, amount, available - amount}";

// KEYS[1]: hash of bucket index -> amount
// ARGV[1]: max amount
// ARGV[2]: requested amount
// ARGV[3]: current bucket index
// ARGV[4]: first bucket index in the window
// ARGV[5]: TTL of the hash in ms
// ARGV[6]: best effort (1 or 0)
//
// Buckets outside first..=current are dropped. Those above current were
// written with another bucket duration.
pub const SCRIPT_ROLLING_WINDOW: &str = "
    local current = tonumber(ARGV[3])
    local first = tonumber(ARGV[4])
    local buckets = redis.call('hgetall', KEYS[1])
    local used = 0
    for i = 1, #buckets, 2 do
        local bucket = tonumber(buckets[i])
        if bucket < first or bucket > current then
            redis.call('hdel', KEYS[1], buckets[i])
        else
            used = used + tonumber(buckets[i + 1])
        end
    end
    local available = math.max(tonumber(ARGV[1]) - used, 0)
    local amount = tonumber(ARGV[2])
    if amount > available then
        if ARGV[6] == '1' and available > 0 then
            amount = available
        else
            return {0, 0, available}
        end
    end
    if amount > 0 then
        redis.call('hincrby', KEYS[1], ARGV[3], amount)
        redis.call('pexpire', KEYS[1], ARGV[5])
    end
    return {1, amount, available - amount}";

// KEYS[1]: hash of bucket index -> amount
// ARGV[1]: first bucket index in the window
// ARGV[2]: current bucket index
pub const SCRIPT_ROLLING_USAGE: &str = "
    local first = tonumber(ARGV[1])
    local current = tonumber(ARGV[2])
    local buckets = redis.call('hgetall', KEYS[1])
    local used = 0
    for i = 1, #buckets, 2 do
        local bucket = tonumber(buckets[i])
        if bucket >= first and bucket <= current then
            used = used + tonumber(buckets[i + 1])
        end
    end
    return used";
