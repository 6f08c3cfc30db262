use super::{Control, Trigger, TriggerError};
use log::{debug, info};
use std::sync::mpsc::Sender;
use tiny_http::{Response, Server};

/// A trigger that polls the remotes on an HTTP request.
///
/// This could be used to deploy from git remotes (e.g. GitHub, GitLab) with webhooks,
/// without waiting for the next poll. Requests to `/` poll every project, requests
/// to `/<project>` poll only that project.
pub struct HttpTrigger {
    http: String,
    projects: Vec<String>,
}

impl HttpTrigger {
    /// Create an new HTTP trigger with an address (e.g. "0.0.0.0:1234") and the
    /// names of the projects that can be polled.
    pub fn new(http: String, projects: Vec<String>) -> Self {
        Self { http, projects }
    }

    /// The control message for the path, `None` if there is no such project.
    fn route(&self, url: &str) -> Option<Control> {
        let path = url.split('?').next().unwrap_or_default().trim_matches('/');
        if path.is_empty() {
            return Some(Control::PollNow(None));
        }

        self.projects
            .iter()
            .find(|project| project.as_str() == path)
            .map(|project| Control::PollNow(Some(project.clone())))
    }
}

impl Trigger for HttpTrigger {
    /// Starts a minimal HTTP 1.1 server, every method is accepted.
    ///
    /// Known paths return 200 with plaintext "OK", unknown projects 404.
    fn listen(&self, tx: Sender<Control>) -> Result<(), TriggerError> {
        let listener = Server::http(&self.http).map_err(|_| {
            TriggerError::Misconfigured(format!("cannot start server on {}", self.http))
        })?;
        info!("Listening on {}.", self.http);

        for request in listener.incoming_requests() {
            debug!("Received request on {} {}.", request.method(), request.url());

            let response = match self.route(request.url()) {
                Some(control) => {
                    tx.send(control)?;
                    Response::from_string("OK")
                }
                None => Response::from_string("Unknown project").with_status_code(404),
            };

            request
                .respond(response)
                .map_err(|err| TriggerError::FailedTrigger(err.to_string()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{error::Error, sync::mpsc, thread, time::Duration};

    fn trigger(address: &str) -> HttpTrigger {
        HttpTrigger::new(
            String::from(address),
            vec![String::from("api"), String::from("web")],
        )
    }

    #[test]
    fn it_should_route_paths_to_projects() {
        let trigger = trigger("0.0.0.0:1234");

        assert_eq!(Some(Control::PollNow(None)), trigger.route("/"));
        assert_eq!(Some(Control::PollNow(None)), trigger.route("/?source=github"));
        assert_eq!(
            Some(Control::PollNow(Some(String::from("api")))),
            trigger.route("/api")
        );
        assert_eq!(
            Some(Control::PollNow(Some(String::from("web")))),
            trigger.route("/web/")
        );
        assert_eq!(None, trigger.route("/worker"));
    }

    #[test]
    fn it_should_poll_on_requests() -> Result<(), Box<dyn Error>> {
        let trigger = trigger("0.0.0.0:12345");
        let (tx, rx) = mpsc::channel::<Control>();

        thread::spawn(move || {
            let _ = trigger.listen(tx);
        });
        thread::sleep(Duration::from_millis(100));

        let result = ureq::get("http://127.0.0.1:12345").call()?;
        assert_eq!(200, result.status());
        assert_eq!("OK", result.into_string()?);

        let result = ureq::post("http://127.0.0.1:12345/api").call()?;
        assert_eq!(200, result.status());
        assert_eq!("OK", result.into_string()?);

        let result = ureq::post("http://127.0.0.1:12345/worker").call();
        assert!(
            matches!(result, Err(ureq::Error::Status(404, _))),
            "{result:?} should be 404"
        );

        assert_eq!(Control::PollNow(None), rx.recv()?);
        assert_eq!(Control::PollNow(Some(String::from("api"))), rx.recv()?);
        assert!(rx.try_recv().is_err());

        Ok(())
    }

    #[test]
    fn it_should_fail_on_an_invalid_address() {
        let trigger = trigger("not an address");
        let (tx, _rx) = mpsc::channel::<Control>();

        let result = trigger.listen(tx);
        assert!(
            matches!(result, Err(TriggerError::Misconfigured(_))),
            "{result:?} should be Misconfigured"
        );
    }
}
