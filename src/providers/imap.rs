use crate::models::Account;
use crate::providers::{Connector, MailSession, ProviderError, RawMessage};
use ::imap::types::Fetch;
use chrono::Utc;
use native_tls::TlsConnector;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const MAILBOX: &str = "INBOX";
const FETCH_QUERY: &str = "(UID INTERNALDATE BODY.PEEK[])";
const HEADER_QUERY: &str = "(UID INTERNALDATE BODY.PEEK[HEADER])";

/// Opens real IMAP sessions, over TLS unless the account opts out.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapConnector;

impl Connector for ImapConnector {
    fn connect(
        &self,
        account: &Account,
        timeout: Duration,
    ) -> Result<Box<dyn MailSession>, ProviderError> {
        let started = Instant::now();
        let tcp = open_socket(account, timeout)?;

        let session: Box<dyn MailSession> = if account.tls {
            let tls = TlsConnector::builder().build()?;
            let stream = tls.connect(&account.server, tcp)?;
            Box::new(login(::imap::Client::new(stream), account)?)
        } else {
            Box::new(login(::imap::Client::new(tcp), account)?)
        };

        info!(
            server = %account.server,
            user = %account.user,
            tls = account.tls,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "imap session established"
        );
        Ok(session)
    }
}

fn open_socket(account: &Account, timeout: Duration) -> Result<TcpStream, ProviderError> {
    let address = (account.server.as_str(), account.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            ProviderError::Network(format!("could not resolve {}:{}", account.server, account.port))
        })?;

    let tcp = TcpStream::connect_timeout(&address, timeout)?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;
    Ok(tcp)
}

fn login<T>(mut client: ::imap::Client<T>, account: &Account) -> Result<ImapSession<T>, ProviderError>
where
    T: Read + Write + Send + 'static,
{
    client.read_greeting()?;

    let mut session = match client.login(&account.user, account.secret()) {
        Ok(session) => session,
        Err((err, _client)) => {
            return Err(match err {
                ::imap::Error::No(message) | ::imap::Error::Bad(message) => {
                    ProviderError::Authentication(message)
                }
                other => ProviderError::from(other),
            });
        }
    };

    let mailbox = match session.select(MAILBOX) {
        Ok(mailbox) => mailbox,
        Err(err) => {
            let _ = session.logout();
            return Err(err.into());
        }
    };

    Ok(ImapSession {
        session,
        uid_validity: mailbox.uid_validity,
    })
}

struct ImapSession<T: Read + Write> {
    session: ::imap::Session<T>,
    uid_validity: Option<u32>,
}

impl<T> MailSession for ImapSession<T>
where
    T: Read + Write + Send + 'static,
{
    fn uid_validity(&self) -> Option<u32> {
        self.uid_validity
    }

    fn search_unseen(&mut self) -> Result<Vec<u32>, ProviderError> {
        let mut uids: Vec<u32> = self.session.uid_search("UNSEEN")?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, ProviderError> {
        self.uid_fetch(uids, HEADER_QUERY, Fetch::header)
    }

    fn fetch(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, ProviderError> {
        self.uid_fetch(uids, FETCH_QUERY, Fetch::body)
    }

    fn logout(&mut self) -> Result<(), ProviderError> {
        self.session.logout()?;
        Ok(())
    }
}

impl<T> ImapSession<T>
where
    T: Read + Write + Send + 'static,
{
    fn uid_fetch(
        &mut self,
        uids: &[u32],
        query: &str,
        section: fn(&Fetch) -> Option<&[u8]>,
    ) -> Result<Vec<RawMessage>, ProviderError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let set = uids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let fetches = self.session.uid_fetch(&set, query)?;
        let messages: Vec<RawMessage> = fetches
            .iter()
            .filter_map(|fetch| raw_message(fetch, section))
            .collect();
        debug!(query, requested = uids.len(), fetched = messages.len(), "uid fetch completed");
        Ok(messages)
    }
}

fn raw_message(fetch: &Fetch, section: fn(&Fetch) -> Option<&[u8]>) -> Option<RawMessage> {
    let Some(uid) = fetch.uid else {
        debug!(sequence = fetch.message, "fetch response without uid dropped");
        return None;
    };
    let Some(body) = section(fetch) else {
        debug!(uid, "fetch response without the requested section dropped");
        return None;
    };
    Some(RawMessage {
        uid,
        internal_date: fetch.internal_date().map(|date| date.with_timezone(&Utc)),
        body: body.to_vec(),
    })
}
