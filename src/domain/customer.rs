//! Who a booking belongs to.
//!
//! Guest bookings carry no account id, only contact details. Modelling this as
//! a sum type keeps the guest paths exhaustive instead of hiding them behind a
//! nullable id.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::BookingEntity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ContactInfo {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerRef {
    Registered { id: i32, contact: ContactInfo },
    Guest { contact: ContactInfo },
}

impl CustomerRef {
    pub fn of(booking: &BookingEntity) -> Self {
        let contact = ContactInfo {
            name: booking.contact_name.clone(),
            email: booking.contact_email.clone(),
            phone: booking.contact_phone.clone(),
        };
        match booking.customer_id {
            Some(id) => CustomerRef::Registered { id, contact },
            None => CustomerRef::Guest { contact },
        }
    }

    pub fn contact(&self) -> &ContactInfo {
        match self {
            CustomerRef::Registered { contact, .. } => contact,
            CustomerRef::Guest { contact } => contact,
        }
    }

    /// Account id, when the customer has one.
    pub fn account_id(&self) -> Option<i32> {
        match self {
            CustomerRef::Registered { id, .. } => Some(*id),
            CustomerRef::Guest { .. } => None,
        }
    }
}
