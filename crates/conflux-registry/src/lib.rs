mod redis_registry;

pub use redis_registry::RedisRoomRegistry;
