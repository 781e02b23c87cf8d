//! Announce tokens handed out by `get_peers` and checked by `announce_peer`
use crate::node::NodeContactInfo;

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use tokio::{sync::Mutex, task::JoinHandle};
use tracing::trace;

const TOKEN_BYTES: usize = 8;

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Token(Vec<u8>);

impl Token {
    pub fn random() -> Self {
        Token(rand::random::<[u8; TOKEN_BYTES]>().to_vec())
    }
}

impl From<Vec<u8>> for Token {
    fn from(bytes: Vec<u8>) -> Self {
        Token(bytes)
    }
}

impl AsRef<[u8]> for Token {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", hex::encode(&self.0))
    }
}

struct Issued {
    token: Token,
    generation: u64,
    timer: JoinHandle<()>,
}

type Tokens = Mutex<HashMap<NodeContactInfo, Issued>>;

/// One live token per contact. Each entry is removed by its own timer once
/// `ttl` has passed; reissuing cancels the old timer.
pub struct TokenStore {
    ttl: Duration,
    generation: AtomicU64,
    tokens: Arc<Tokens>,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            generation: AtomicU64::new(0),
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Issues a fresh token for `contact`, replacing any earlier one.
    pub async fn issue(&self, contact: NodeContactInfo) -> Token {
        let token = Token::random();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let weak = Arc::downgrade(&self.tokens);
        let ttl = self.ttl;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            expire(weak, contact, generation).await;
        });

        let replaced = self.tokens.lock().await.insert(
            contact,
            Issued {
                token: token.clone(),
                generation,
                timer,
            },
        );
        if let Some(replaced) = replaced {
            replaced.timer.abort();
        }

        token
    }

    pub async fn verify(&self, contact: &NodeContactInfo, token: &Token) -> bool {
        let tokens = self.tokens.lock().await;
        match tokens.get(contact) {
            Some(issued) => issued.token == *token,
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }
}

async fn expire(tokens: Weak<Tokens>, contact: NodeContactInfo, generation: u64) {
    let tokens = match tokens.upgrade() {
        Some(tokens) => tokens,
        None => return,
    };
    let mut tokens = tokens.lock().await;
    // a newer token may have replaced this one after the timer fired
    if tokens.get(&contact).map(|i| i.generation) == Some(generation) {
        tokens.remove(&contact);
        trace!(%contact, "token expired");
    }
}
