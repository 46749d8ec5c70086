//! C7: Middleware Pipeline — ordered transforms applied on request,
//! response, and error. See spec §4.6.

pub mod builtin;

use async_trait::async_trait;

use crate::error::{MiddlewareError, MiddlewarePhase};
use crate::types::{Request, Response};

/// Outcome of the request phase: either the (possibly transformed) request
/// continues down the chain, or a middleware short-circuits with a
/// synthetic response.
pub enum RequestOutcome {
    Continue(Request),
    ShortCircuit(Response),
}

/// A middleware exposes up to three optional hooks, each defaulting to a
/// pass-through.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn on_request(&self, req: Request) -> Result<RequestOutcome, MiddlewareError> {
        Ok(RequestOutcome::Continue(req))
    }

    async fn on_response(&self, resp: Response, _req: &Request) -> Result<Response, MiddlewareError> {
        Ok(resp)
    }

    /// `Ok(Some(resp))` recovers with a synthetic response; `Ok(None)`
    /// forwards the error to the next middleware (or propagates if none
    /// remain); `Err` aborts the exception chain outright.
    async fn on_exception(
        &self,
        _err: &crate::error::CrawlError,
        _req: &Request,
    ) -> Result<Option<Response>, MiddlewareError> {
        Ok(None)
    }
}

/// Runs the request phase in forward order. The first middleware that
/// short-circuits with a response stops subsequent request hooks.
pub async fn process_request(
    req: Request,
    middlewares: &[std::sync::Arc<dyn Middleware>],
) -> Result<RequestOutcome, MiddlewareError> {
    let mut current = req;
    for mw in middlewares {
        match mw.on_request(current).await? {
            RequestOutcome::Continue(next) => current = next,
            RequestOutcome::ShortCircuit(resp) => return Ok(RequestOutcome::ShortCircuit(resp)),
        }
    }
    Ok(RequestOutcome::Continue(current))
}

/// Runs the response phase in reverse order; each middleware transforms the
/// response in turn.
pub async fn process_response(
    resp: Response,
    req: &Request,
    middlewares: &[std::sync::Arc<dyn Middleware>],
) -> Result<Response, MiddlewareError> {
    let mut current = resp;
    for mw in middlewares.iter().rev() {
        current = mw.on_response(current, req).await?;
    }
    Ok(current)
}

/// Runs the exception phase in reverse order; the first middleware that
/// recovers stops the chain. If none recover, the error propagates to the
/// caller (`Ok(None)`).
pub async fn process_exception(
    err: &crate::error::CrawlError,
    req: &Request,
    middlewares: &[std::sync::Arc<dyn Middleware>],
) -> Result<Option<Response>, MiddlewareError> {
    for mw in middlewares.iter().rev() {
        if let Some(resp) = mw.on_exception(err, req).await? {
            return Ok(Some(resp));
        }
    }
    Ok(None)
}
