// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Submitting signed login ticket requests to the WSAA `loginCms` operation.

use std::{future::Future, time::Duration};

use crate::{
    error::{Error, TransportError},
    xml,
};

/// The network boundary of ticket issuance.
///
/// Implementations make a single attempt; retrying is left to the caller.
pub trait AuthGateway: Send + Sync {
    /// Submit the base64-encoded CMS structure to `endpoint` and return the login ticket
    /// response document.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] if the service can't be reached or responds with a failure, and
    /// [`Error::Protocol`] if it responds successfully with something that isn't a `loginCms`
    /// response.
    fn submit(
        &self,
        signed_request: &str,
        endpoint: &str,
    ) -> impl Future<Output = Result<String, Error>> + Send;
}

/// Calls `loginCms` over SOAP 1.1.
#[derive(Debug, Clone)]
pub struct SoapGateway {
    client: reqwest::Client,
}

impl SoapGateway {
    /// Create a gateway whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TransportError::from)?;
        Ok(Self { client })
    }

    fn envelope(signed_request: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
            <soapenv:Envelope \
                xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\" \
                xmlns:wsaa=\"http://wsaa.view.sua.dvadac.desein.afip.gov\">\
                <soapenv:Header/>\
                <soapenv:Body>\
                    <wsaa:loginCms><wsaa:in0>{}</wsaa:in0></wsaa:loginCms>\
                </soapenv:Body>\
            </soapenv:Envelope>",
            quick_xml::escape::escape(signed_request),
        )
    }
}

/// Pull the login ticket response document out of a SOAP response body.
pub(crate) fn login_cms_return(status: u16, body: &str) -> Result<String, Error> {
    // Faults arrive with a 500 status, so check for one before looking at the status.
    if let Some(message) = xml::element_text(body, "faultstring").ok().flatten() {
        let code = xml::element_text(body, "faultcode")
            .ok()
            .flatten()
            .unwrap_or_default();
        return Err(TransportError::Fault { code, message }.into());
    }
    if !(200..300).contains(&status) {
        return Err(TransportError::Status(status).into());
    }

    xml::element_text(body, "loginCmsReturn")
        .map_err(Error::Protocol)?
        .ok_or_else(|| Error::Protocol("the response has no loginCmsReturn element".to_string()))
}

impl AuthGateway for SoapGateway {
    #[tracing::instrument(level = "debug", skip_all, fields(endpoint = %endpoint))]
    async fn submit(&self, signed_request: &str, endpoint: &str) -> Result<String, Error> {
        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", "\"\"")
            .body(Self::envelope(signed_request))
            .send()
            .await
            .map_err(TransportError::from)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(TransportError::from)?;
        tracing::debug!(status, body_size = body.len(), "Received loginCms response");

        login_cms_return(status, &body)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    const SUCCESS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
 <soapenv:Body>
  <loginCmsResponse xmlns="http://wsaa.view.sua.dvadac.desein.afip.gov">
   <loginCmsReturn>&lt;?xml version="1.0" encoding="UTF-8" standalone="yes"?&gt;
&lt;loginTicketResponse version="1.0"&gt;&lt;header&gt;&lt;uniqueId&gt;1&lt;/uniqueId&gt;&lt;/header&gt;&lt;/loginTicketResponse&gt;</loginCmsReturn>
  </loginCmsResponse>
 </soapenv:Body>
</soapenv:Envelope>"#;

    const FAULT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
 <soapenv:Body>
  <soapenv:Fault>
   <faultcode xmlns:ns1="http://xml.apache.org/axis/">ns1:coe.alreadyAuthenticated</faultcode>
   <faultstring>El CEE ya posee un TA valido para el acceso al WSN solicitado</faultstring>
  </soapenv:Fault>
 </soapenv:Body>
</soapenv:Envelope>"#;

    #[test]
    fn success_body() -> Result<()> {
        let document = login_cms_return(200, SUCCESS)?;

        assert!(document.starts_with("<?xml"));
        assert!(document.contains("<uniqueId>1</uniqueId>"));
        Ok(())
    }

    #[test]
    fn fault_body() {
        let error = login_cms_return(500, FAULT).unwrap_err();

        assert!(matches!(
            error,
            Error::Transport(TransportError::Fault { code, message })
                if code == "ns1:coe.alreadyAuthenticated" && message.contains("TA valido")
        ));
    }

    #[test]
    fn error_status_without_fault() {
        assert!(matches!(
            login_cms_return(503, "<html>Service Unavailable</html>"),
            Err(Error::Transport(TransportError::Status(503)))
        ));
    }

    #[test]
    fn success_without_return() {
        assert!(matches!(
            login_cms_return(200, "<soapenv:Envelope><soapenv:Body/></soapenv:Envelope>"),
            Err(Error::Protocol(_))
        ));
    }

    // Serve a single canned HTTP response, returning the request body that was received.
    async fn serve_once(
        listener: TcpListener,
        status: &'static str,
        body: &'static str,
    ) -> Result<String> {
        let (mut stream, _) = listener.accept().await?;
        let mut request = vec![];
        let mut buffer = [0; 4096];
        while !String::from_utf8_lossy(&request).contains("</soapenv:Envelope>") {
            let bytes_read = stream.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }
            request.extend_from_slice(&buffer[..bytes_read]);
        }

        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(String::from_utf8(request)?)
    }

    #[tokio::test]
    async fn submit_posts_soap_envelope() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = format!("http://{}/ws/services/LoginCms", listener.local_addr()?);
        let server = tokio::spawn(serve_once(listener, "200 OK", SUCCESS));

        let gateway = SoapGateway::new(Duration::from_secs(10))?;
        let document = gateway.submit("TUlJRm9nWUpLb1pJaHZjTg==", &endpoint).await?;

        let request = server.await??;
        assert!(request.starts_with("POST /ws/services/LoginCms HTTP/1.1"));
        assert!(request.to_lowercase().contains("soapaction: \"\""));
        assert!(request.contains("<wsaa:in0>TUlJRm9nWUpLb1pJaHZjTg==</wsaa:in0>"));
        assert!(document.contains("<loginTicketResponse"));
        Ok(())
    }

    #[tokio::test]
    async fn submit_reports_faults() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = format!("http://{}/ws/services/LoginCms", listener.local_addr()?);
        let server = tokio::spawn(serve_once(listener, "500 Internal Server Error", FAULT));

        let gateway = SoapGateway::new(Duration::from_secs(10))?;
        let result = gateway.submit("TUlJRm9n", &endpoint).await;

        server.await??;
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::Fault { .. }))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_endpoint() -> Result<()> {
        // Bind and drop a listener to find a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = format!("http://{}/", listener.local_addr()?);
        drop(listener);

        let gateway = SoapGateway::new(Duration::from_secs(10))?;
        let result = gateway.submit("TUlJRm9n", &endpoint).await;

        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::Http(_)))
        ));
        Ok(())
    }
}
