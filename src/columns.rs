use std::fmt;
use std::rc::Rc;

use actix_web::HttpRequest;

use crate::record::ResponseRecord;

/// Custom-column extraction function. Receives the request and, once the
/// downstream handler has produced one, the captured response.
pub type Extractor = Rc<dyn Fn(&HttpRequest, Option<&ResponseRecord>) -> Option<String>>;

/// Registered extraction functions, evaluated in registration order so values
/// line up positionally with the store's custom-column schema.
#[derive(Clone, Default)]
pub struct ColumnSet {
    extractors: Vec<Extractor>,
}

impl ColumnSet {
    pub fn push(
        &mut self,
        f: impl Fn(&HttpRequest, Option<&ResponseRecord>) -> Option<String> + 'static,
    ) {
        self.extractors.push(Rc::new(f));
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// One value per extractor, in registration order.
    pub fn extract(
        &self,
        req: &HttpRequest,
        res: Option<&ResponseRecord>,
    ) -> Vec<Option<String>> {
        self.extractors.iter().map(|f| f(req, res)).collect()
    }
}

impl fmt::Debug for ColumnSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnSet")
            .field("extractors", &self.extractors.len())
            .finish()
    }
}
