use std::sync::OnceLock;
use tokio::sync::Mutex;

/// Relay buffer size used by the tunnel splice loop
pub const BUFFER_SIZE: usize = 16_384;

const MAX_POOL_SIZE: usize = 64;

/// Pool of relay buffers reused across tunnel connections
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    async fn get(&self) -> Vec<u8> {
        let mut pool = self.buffers.lock().await;
        pool.pop().unwrap_or_else(|| vec![0u8; BUFFER_SIZE])
    }

    async fn put(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < BUFFER_SIZE {
            return;
        }
        // Zero on return so no tunnel data leaks between connections
        buffer.clear();
        buffer.resize(BUFFER_SIZE, 0);

        let mut pool = self.buffers.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }
}

fn pool() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(BufferPool::new)
}

/// Get a zeroed relay buffer from the pool, allocating if the pool is empty
pub async fn get_buffer() -> Vec<u8> {
    pool().get().await
}

/// Return a relay buffer to the pool for reuse
pub async fn return_buffer(buffer: Vec<u8>) {
    pool().put(buffer).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffers_are_sized_and_zeroed() {
        let buf = get_buffer().await;
        assert_eq!(buf.len(), BUFFER_SIZE);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn returned_buffer_is_scrubbed_before_reuse() {
        let mut buf = get_buffer().await;
        buf[0] = 0xAB;
        return_buffer(buf).await;

        // Whatever buffer the pool hands out next must be clean
        let buf = get_buffer().await;
        assert!(buf.iter().all(|&b| b == 0));
        return_buffer(buf).await;
    }

    #[tokio::test]
    async fn undersized_buffers_are_rejected() {
        return_buffer(vec![0u8; 16]).await;
        let buf = get_buffer().await;
        assert_eq!(buf.len(), BUFFER_SIZE);
    }
}
