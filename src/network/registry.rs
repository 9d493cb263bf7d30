use super::connection::Connection;
use mio::Token;
use std::collections::HashMap;

/// Live connections of one dispatch loop, keyed by poll token
///
/// Tokens are handed out monotonically and never reused, so an event or a
/// late completion for a closed connection can never reach its successor.
pub struct ConnectionRegistry {
    connections: HashMap<Token, Connection>,
    next_token: usize,
}

impl ConnectionRegistry {
    /// `first_token` is the lowest token connections may use; smaller values
    /// are reserved for the listener and waker.
    pub fn new(first_token: usize) -> Self {
        Self {
            connections: HashMap::new(),
            next_token: first_token,
        }
    }

    /// Reserve the token for the next connection
    pub fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn insert(&mut self, token: Token, connection: Connection) {
        self.connections.insert(token, connection);
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.get_mut(&token)
    }

    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        self.connections.remove(&token)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Response bytes queued across every connection
    pub fn pending_output(&self) -> usize {
        self.connections.values().map(Connection::pending_output).sum()
    }

    /// Take every connection out of the registry
    pub fn drain(&mut self) -> impl Iterator<Item = (Token, Connection)> + '_ {
        self.connections.drain()
    }
}
