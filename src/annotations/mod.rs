//! Annotation store.
//!
//! Annotations are a delimited table with one row per slide. The `patient`
//! column is mandatory; the `slide` column links each row to a slide name and
//! can be filled in from the slide directories with [`associate_slides`].

mod associate;
mod labels;
mod table;

pub use associate::{associate_slides, backup_path, AssociationSummary};
pub use labels::{LabelMode, OutcomeLabel, SlideLabels};
pub use table::{
    is_blank, shortname, AnnotationRow, AnnotationTable, PATIENT_COLUMN, SHORTNAME_LEN,
    SLIDE_COLUMN,
};
